pub mod config_loader;
pub mod containers;
pub mod daemon;
pub mod dependency;
pub mod deploy;
pub mod docker_cli;
pub mod image_archive;
pub mod listener;
pub mod manifest;
pub mod reconcile;
pub mod state;
pub mod system;
pub mod teardown;
pub mod upload;

pub use daemon::DaemonGateway;
pub use docker_cli::DockerCli;
pub use listener::EventListener;
pub use state::StateStore;
pub use system::BeamoSystem;
pub use upload::{ProgressReporter, RegistryUploader};
