use std::path::Path;

use crate::error::{BeamoError, Result};
use crate::models::BeamoConfig;

const CONFIG_FILENAME: &str = "beamo.yaml";
const ACCESS_TOKEN_ENV: &str = "BEAM_ACCESS_TOKEN";

/// Loads `beamo.yaml` from the state directory. A missing file yields defaults.
pub fn load(state_directory: &Path) -> Result<BeamoConfig> {
    let mut config = load_file(state_directory)?;
    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        if !token.is_empty() {
            config.access_token = Some(token);
        }
    }
    Ok(config)
}

fn load_file(state_directory: &Path) -> Result<BeamoConfig> {
    let config_path = state_directory.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Ok(BeamoConfig::default());
    }
    let contents = std::fs::read_to_string(&config_path)?;
    let config: BeamoConfig =
        serde_yaml::from_str(&contents).map_err(|e| BeamoError::InvalidConfig(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load`], but the file must exist.
pub fn load_required(state_directory: &Path) -> Result<BeamoConfig> {
    let config_path = state_directory.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Err(BeamoError::ConfigNotFound(config_path));
    }
    load(state_directory)
}

fn validate(config: &BeamoConfig) -> Result<()> {
    if config.docker_path.is_empty() {
        return Err(BeamoError::InvalidConfig("docker_path must not be empty".into()));
    }
    if !config.registry_url.is_empty() && !config.registry_url.ends_with('/') {
        return Err(BeamoError::InvalidConfig(
            "registry_url must end with '/'".into(),
        ));
    }
    if config.upload.chunk_size == Some(0) {
        return Err(BeamoError::InvalidConfig("upload.chunk_size must be positive".into()));
    }
    Ok(())
}
