use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{BeamoError, Result};
use crate::models::{Manifest, Runtime};
use crate::services::daemon::DaemonGateway;

/// Swallows failures that only say the target is already gone.
pub fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.daemon_kind().is_some_and(|k| k.is_missing()) => {
            debug!(error = %e, "target already gone");
            Ok(())
        }
        other => other,
    }
}

pub async fn stop_service(gateway: &dyn DaemonGateway, runtime: &RwLock<Runtime>, beamo_id: &str) -> Result<()> {
    let running: Vec<String> = runtime
        .read()
        .await
        .instances_for(beamo_id)
        .into_iter()
        .filter(|si| si.is_running)
        .map(|si| si.container_id.clone())
        .collect();

    for container_id in &running {
        tolerate_missing(gateway.stop_container(container_id).await)?;
        if let Some(instance) = runtime.write().await.find_by_container_id_mut(container_id) {
            instance.is_running = false;
        }
    }
    info!(service = beamo_id, containers = running.len(), "stopped service");
    Ok(())
}

pub async fn remove_containers(gateway: &dyn DaemonGateway, runtime: &RwLock<Runtime>, beamo_id: &str) -> Result<()> {
    let containers: Vec<String> = runtime
        .read()
        .await
        .instances_for(beamo_id)
        .into_iter()
        .map(|si| si.container_id.clone())
        .collect();

    for container_id in &containers {
        tolerate_missing(gateway.remove_container(container_id).await)?;
        runtime.write().await.remove_container(container_id);
    }
    Ok(())
}

/// Removes a service's containers and then its image.
pub async fn clean_up(
    gateway: &dyn DaemonGateway,
    manifest: &RwLock<Manifest>,
    runtime: &RwLock<Runtime>,
    beamo_id: &str,
) -> Result<()> {
    let (image_id, rebuildable) = {
        let manifest = manifest.read().await;
        let definition = manifest
            .definition(beamo_id)
            .ok_or_else(|| BeamoError::UnknownService(beamo_id.to_string()))?;
        (
            definition.image_id.clone(),
            manifest.can_be_built_locally(beamo_id).unwrap_or(false),
        )
    };

    remove_containers(gateway, runtime, beamo_id).await?;
    if !image_id.is_empty() {
        tolerate_missing(gateway.remove_image(&image_id).await)?;
        if rebuildable {
            if let Some(definition) = manifest.write().await.definition_mut(beamo_id) {
                definition.image_id.clear();
            }
        }
    }
    info!(service = beamo_id, "cleaned up service");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonErrorKind;

    #[test]
    fn only_missing_targets_are_tolerated() {
        assert!(tolerate_missing(Err(BeamoError::daemon(DaemonErrorKind::NoSuchImage, "gone"))).is_ok());
        assert!(tolerate_missing(Err(BeamoError::daemon(DaemonErrorKind::NoSuchContainer, "gone"))).is_ok());
        assert!(tolerate_missing(Err(BeamoError::daemon(DaemonErrorKind::Unavailable, "down"))).is_err());
        assert!(tolerate_missing(Err(BeamoError::Cancelled)).is_err());
    }
}
