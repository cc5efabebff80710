use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BeamoConfig {
    #[serde(default = "default_docker_path")]
    pub docker_path: String,
    #[serde(default)]
    pub registry_url: String,
    #[serde(default)]
    pub cid: String,
    #[serde(default)]
    pub pid: String,
    /// Overridden by `BEAM_ACCESS_TOKEN` when set.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for BeamoConfig {
    fn default() -> Self {
        Self {
            docker_path: default_docker_path(),
            registry_url: String::new(),
            cid: String::new(),
            pid: String::new(),
            access_token: None,
            upload: UploadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_force_https")]
    pub force_https: bool,
    /// Chunk size in bytes. When set, blobs are sent as `PATCH` chunks instead of one `PUT`.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            force_https: default_force_https(),
            chunk_size: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_docker_path() -> String {
    "docker".into()
}

fn default_force_https() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}
