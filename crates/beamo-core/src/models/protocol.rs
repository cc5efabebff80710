use serde::{Deserialize, Serialize};

/// The kind of service a definition describes. Never changes after creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolType {
    HttpMicroservice,
    EmbeddedMongoDb,
}

impl ProtocolType {
    /// Suffix appended to the beamo id to form the container name.
    pub fn container_suffix(self) -> &'static str {
        match self {
            Self::HttpMicroservice => "httpMicroservice",
            Self::EmbeddedMongoDb => "storage",
        }
    }

    pub fn container_name(self, beamo_id: &str) -> String {
        format!("{beamo_id}_{}", self.container_suffix())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub local_port: String,
    pub in_container_port: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamedVolume {
    pub volume_name: String,
    pub in_container_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindMount {
    pub is_read_only: bool,
    pub local_path: String,
    pub in_container_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Local run configuration for an HTTP microservice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMicroserviceLocalProtocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_build_context_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_dockerfile_path: Option<String>,
    #[serde(default)]
    pub cid: String,
    #[serde(default)]
    pub pid: String,
    #[serde(default)]
    pub realm_secret: String,
    #[serde(default)]
    pub web_socket_host: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub prefix: String,
    pub health_check_endpoint: String,
    pub health_check_internal_port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_src_for_hot_reloading: Option<BindMount>,
    #[serde(default)]
    pub storage_dependency_beamo_ids: Vec<String>,
    #[serde(default)]
    pub custom_port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub custom_bind_mounts: Vec<BindMount>,
    #[serde(default)]
    pub custom_volumes: Vec<NamedVolume>,
    #[serde(default)]
    pub custom_environment_variables: Vec<EnvironmentVariable>,
}

impl Default for HttpMicroserviceLocalProtocol {
    fn default() -> Self {
        Self {
            docker_build_context_path: None,
            relative_dockerfile_path: None,
            cid: String::new(),
            pid: String::new(),
            realm_secret: String::new(),
            web_socket_host: String::new(),
            log_level: "Information".into(),
            prefix: String::new(),
            health_check_endpoint: "health".into(),
            health_check_internal_port: "6565".into(),
            bind_src_for_hot_reloading: None,
            storage_dependency_beamo_ids: Vec::new(),
            custom_port_bindings: Vec::new(),
            custom_bind_mounts: Vec::new(),
            custom_volumes: Vec::new(),
            custom_environment_variables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpMicroserviceRemoteProtocol {
    pub health_check_endpoint: String,
    pub health_check_port: String,
    #[serde(default)]
    pub custom_environment_variables: Vec<EnvironmentVariable>,
}

impl Default for HttpMicroserviceRemoteProtocol {
    fn default() -> Self {
        Self {
            health_check_endpoint: "health".into(),
            health_check_port: "6565".into(),
            custom_environment_variables: Vec::new(),
        }
    }
}

pub const DEFAULT_MONGO_IMAGE: &str = "mongo:7.0";

/// Local run configuration for an embedded MongoDB storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedMongoDbLocalProtocol {
    pub base_image: String,
    pub root_username: String,
    pub root_password: String,
    pub data_volume_in_container_path: String,
    pub files_volume_in_container_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongo_local_port: Option<String>,
}

impl Default for EmbeddedMongoDbLocalProtocol {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_MONGO_IMAGE.into(),
            root_username: "beamable".into(),
            root_password: "beamable".into(),
            data_volume_in_container_path: "/data/db".into(),
            files_volume_in_container_path: "/beamable".into(),
            mongo_local_port: None,
        }
    }
}

impl EmbeddedMongoDbLocalProtocol {
    pub fn data_volume_name(beamo_id: &str) -> String {
        format!("{beamo_id}_data")
    }

    pub fn files_volume_name(beamo_id: &str) -> String {
        format!("{beamo_id}_files")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedMongoDbRemoteProtocol {}

/// Local protocol payload, tagged by protocol type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protocol", rename_all = "camelCase")]
pub enum LocalProtocol {
    HttpMicroservice(HttpMicroserviceLocalProtocol),
    EmbeddedMongoDb(EmbeddedMongoDbLocalProtocol),
}

impl LocalProtocol {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            Self::HttpMicroservice(_) => ProtocolType::HttpMicroservice,
            Self::EmbeddedMongoDb(_) => ProtocolType::EmbeddedMongoDb,
        }
    }
}

/// Remote protocol payload, tagged by protocol type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protocol", rename_all = "camelCase")]
pub enum RemoteProtocol {
    HttpMicroservice(HttpMicroserviceRemoteProtocol),
    EmbeddedMongoDb(EmbeddedMongoDbRemoteProtocol),
}

impl RemoteProtocol {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            Self::HttpMicroservice(_) => ProtocolType::HttpMicroservice,
            Self::EmbeddedMongoDb(_) => ProtocolType::EmbeddedMongoDb,
        }
    }
}
