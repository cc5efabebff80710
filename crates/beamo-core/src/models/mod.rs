pub mod config;
pub mod daemon;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod service;

pub use config::{BeamoConfig, UploadConfig};
pub use daemon::{BuildRequest, ContainerAction, ContainerDetails, ContainerEvent, ContainerSpec, ProgressFn};
pub use events::{DeployEvent, ServiceStateChange};
pub use protocol::{
    BindMount, EmbeddedMongoDbLocalProtocol, EmbeddedMongoDbRemoteProtocol, EnvironmentVariable,
    HttpMicroserviceLocalProtocol, HttpMicroserviceRemoteProtocol, LocalProtocol, NamedVolume,
    PortBinding, ProtocolType, RemoteProtocol,
};
pub use registry::{BlobDescriptor, DockerArchiveManifest, UploadManifest, UploadReport};
pub use runtime::{Runtime, ServiceInstance};
pub use service::{Manifest, ServiceDefinition};
