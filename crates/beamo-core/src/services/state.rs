use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BeamoError, Result};
use crate::models::{Manifest, Runtime};

const MANIFEST_FILE: &str = "beamoLocalManifest.json";
const RUNTIME_FILE: &str = "beamoLocalRuntime.json";

/// Persists the manifest and runtime as JSON documents in the state directory.
pub struct StateStore {
    manifest_path: PathBuf,
    runtime_path: PathBuf,
}

impl StateStore {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            manifest_path: state_directory.join(MANIFEST_FILE),
            runtime_path: state_directory.join(RUNTIME_FILE),
        }
    }

    pub async fn load_manifest(&self) -> Result<Manifest> {
        read_or_default(&self.manifest_path).await
    }

    pub async fn load_runtime(&self) -> Result<Runtime> {
        read_or_default(&self.runtime_path).await
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_json(&self.manifest_path, manifest).await
    }

    pub async fn save_runtime(&self, runtime: &Runtime) -> Result<()> {
        write_json(&self.runtime_path, runtime).await
    }
}

async fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| BeamoError::State(format!("failed to read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&json)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BeamoError::State(format!("failed to create state dir: {e}")))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| BeamoError::State(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}
