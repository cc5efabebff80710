use futures::future::try_join_all;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BeamoError, DaemonErrorKind, Result};
use crate::models::{
    DeployEvent, LocalProtocol, Manifest, ProtocolType, Runtime, ServiceDefinition,
};
use crate::services::containers::container_spec;
use crate::services::daemon::DaemonGateway;
use crate::services::dependency::{build_dependency_layers, split_layer_by_protocol, validate_all_acyclic};
use crate::services::reconcile::instance_from;
use crate::services::teardown::tolerate_missing;

fn emit(events: Option<&mpsc::UnboundedSender<DeployEvent>>, event: DeployEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn checkpoint(cancel: &CancellationToken, phase: &str) -> Result<()> {
    if cancel.is_cancelled() {
        info!(phase, "deployment cancelled");
        return Err(BeamoError::Cancelled);
    }
    Ok(())
}

/// Targets to deploy: the requested ids (or every definition) that can be built or pulled here.
pub fn select_deployable(manifest: &Manifest, target_ids: Option<&[String]>) -> Result<Vec<ServiceDefinition>> {
    let requested: Vec<&ServiceDefinition> = match target_ids {
        Some(ids) => ids
            .iter()
            .map(|id| {
                manifest
                    .definition(id)
                    .ok_or_else(|| BeamoError::UnknownService(id.clone()))
            })
            .collect::<Result<_>>()?,
        None => manifest.service_definitions.iter().collect(),
    };

    let mut selected = Vec::with_capacity(requested.len());
    for definition in requested {
        if manifest.can_be_built_locally(&definition.beamo_id)? {
            selected.push(definition.clone());
        } else {
            debug!(service = %definition.beamo_id, "skipping service that cannot be built locally");
        }
    }
    Ok(selected)
}

/// Builds or pulls every selected image, then starts containers layer by layer.
///
/// All validation happens before the first daemon call. Cancellation is checked at phase
/// boundaries only. Containers started before a failure are left running; deploying again
/// is the recovery path since unchanged running services are skipped.
pub async fn deploy(
    gateway: &dyn DaemonGateway,
    manifest: &RwLock<Manifest>,
    runtime: &RwLock<Runtime>,
    target_ids: Option<&[String]>,
    cancel: &CancellationToken,
    events: Option<&mpsc::UnboundedSender<DeployEvent>>,
) -> Result<()> {
    let snapshot = manifest.read().await.clone();
    let selected = select_deployable(&snapshot, target_ids)?;
    validate_all_acyclic(&selected, &snapshot.service_definitions)?;
    let layers = build_dependency_layers(&selected)?;
    if selected.is_empty() {
        info!("nothing to deploy");
        return Ok(());
    }

    checkpoint(cancel, "before image phase")?;
    info!(services = selected.len(), "preparing images");
    let images = try_join_all(
        selected
            .iter()
            .map(|definition| prepare_image(gateway, &snapshot, definition, events)),
    )
    .await?;
    checkpoint(cancel, "after image phase")?;

    let updated = {
        let mut manifest = manifest.write().await;
        for (definition, image_id) in selected.iter().zip(&images) {
            if let Some(stored) = manifest.definition_mut(&definition.beamo_id) {
                stored.image_id = image_id.clone();
            }
        }
        manifest.clone()
    };

    checkpoint(cancel, "before run phase")?;
    let updated = &updated;
    for (index, layer) in layers.iter().enumerate() {
        let mut groups: Vec<(ProtocolType, Vec<ServiceDefinition>)> =
            split_layer_by_protocol(layer).into_iter().collect();
        // Storages come up before the services in the same layer.
        groups.sort_by_key(|(protocol, _)| *protocol != ProtocolType::EmbeddedMongoDb);

        for (protocol, group) in groups {
            debug!(layer = index, ?protocol, services = group.len(), "starting containers");
            try_join_all(group.iter().map(|definition| async move {
                let current = updated
                    .definition(&definition.beamo_id)
                    .unwrap_or(definition);
                run_container(gateway, updated, runtime, current, events).await
            }))
            .await?;
        }
    }
    checkpoint(cancel, "after run phase")?;

    info!(services = selected.len(), "deployment finished");
    Ok(())
}

async fn prepare_image(
    gateway: &dyn DaemonGateway,
    manifest: &Manifest,
    definition: &ServiceDefinition,
    events: Option<&mpsc::UnboundedSender<DeployEvent>>,
) -> Result<String> {
    let beamo_id = definition.beamo_id.as_str();
    let report = move |progress: f32| {
        emit(
            events,
            DeployEvent::ImageProgress {
                beamo_id: beamo_id.to_string(),
                progress,
            },
        )
    };

    let image_id = match manifest.local_protocol(beamo_id) {
        Some(LocalProtocol::HttpMicroservice(_)) => {
            let request = manifest.build_request(beamo_id)?;
            info!(service = beamo_id, tag = %request.tag, "building image");
            gateway.build_image(&request, &report).await?
        }
        Some(LocalProtocol::EmbeddedMongoDb(local)) => {
            info!(service = beamo_id, image = %local.base_image, "pulling image");
            gateway.pull_image(&local.base_image, &report).await?
        }
        None => return Err(BeamoError::ProtocolMismatch(beamo_id.to_string())),
    };
    debug!(service = beamo_id, image = %image_id, "image ready");
    Ok(image_id)
}

/// Create-or-replace. A running container on the current image is left alone; a stopped one
/// is started again; anything else is replaced.
async fn run_container(
    gateway: &dyn DaemonGateway,
    manifest: &Manifest,
    runtime: &RwLock<Runtime>,
    definition: &ServiceDefinition,
    events: Option<&mpsc::UnboundedSender<DeployEvent>>,
) -> Result<()> {
    let beamo_id = definition.beamo_id.as_str();
    let spec = container_spec(manifest, definition)?;
    let existing = runtime.read().await.find_by_container_name(&spec.name).cloned();

    if let Some(existing) = existing {
        if existing.image_id == definition.image_id {
            if existing.is_running {
                debug!(service = beamo_id, container = %existing.container_id, "already running current image");
                emit(events, DeployEvent::ServiceDeployed { beamo_id: beamo_id.to_string() });
                return Ok(());
            }
            match gateway.start_container(&existing.container_id).await {
                Ok(()) => {
                    record_instance(gateway, runtime, beamo_id, &existing.container_id).await?;
                    info!(service = beamo_id, "restarted container");
                    emit(events, DeployEvent::ServiceDeployed { beamo_id: beamo_id.to_string() });
                    return Ok(());
                }
                Err(e) if e.daemon_kind().is_some_and(|k| k.is_missing()) => {
                    debug!(service = beamo_id, "stopped container vanished, recreating");
                }
                Err(e) => return Err(e),
            }
        }
        tolerate_missing(gateway.remove_container(&existing.container_id).await)?;
        runtime.write().await.remove_container(&existing.container_id);
    }

    let container_id = match gateway.create_container(&spec).await {
        Err(e) if e.daemon_kind() == Some(DaemonErrorKind::Conflict) => {
            warn!(service = beamo_id, container = %spec.name, "container name taken, replacing");
            tolerate_missing(gateway.remove_container(&spec.name).await)?;
            gateway.create_container(&spec).await?
        }
        other => other?,
    };
    gateway.start_container(&container_id).await?;
    record_instance(gateway, runtime, beamo_id, &container_id).await?;

    info!(service = beamo_id, container = %container_id, "service deployed");
    emit(events, DeployEvent::ServiceDeployed { beamo_id: beamo_id.to_string() });
    Ok(())
}

async fn record_instance(
    gateway: &dyn DaemonGateway,
    runtime: &RwLock<Runtime>,
    beamo_id: &str,
    container_id: &str,
) -> Result<()> {
    match gateway.inspect_container(container_id).await {
        Ok(details) => {
            runtime
                .write()
                .await
                .track(instance_from(beamo_id.to_string(), &details));
            Ok(())
        }
        // Auto-removed containers can exit before we look at them.
        Err(e) if e.daemon_kind().is_some_and(|k| k.is_missing()) => {
            warn!(service = beamo_id, container = container_id, "container exited right after start");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
