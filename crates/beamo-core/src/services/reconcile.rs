use std::collections::HashSet;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{
    ContainerAction, ContainerDetails, ContainerEvent, Manifest, Runtime, ServiceInstance,
    ServiceStateChange,
};
use crate::services::daemon::DaemonGateway;

/// What the daemon knows about a service's expected image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageObservation {
    pub beamo_id: String,
    /// `None` when the daemon has no such image.
    pub image_id: Option<String>,
    pub rebuildable: bool,
}

/// Inspects the expected image of every definition.
pub async fn observe_images(gateway: &dyn DaemonGateway, manifest: &Manifest) -> Result<Vec<ImageObservation>> {
    let mut observations = Vec::with_capacity(manifest.service_definitions.len());
    for definition in &manifest.service_definitions {
        let beamo_id = &definition.beamo_id;
        let Some(reference) = manifest.image_reference(beamo_id) else {
            continue;
        };
        let image_id = match gateway.inspect_image(&reference).await {
            Ok(id) => Some(id),
            Err(e) if e.daemon_kind().is_some_and(|k| k.is_missing()) => None,
            Err(e) => return Err(e),
        };
        observations.push(ImageObservation {
            beamo_id: beamo_id.clone(),
            image_id,
            rebuildable: manifest.can_be_built_locally(beamo_id).unwrap_or(false),
        });
    }
    Ok(observations)
}

/// Records observed image ids. A missing image only clears the id of a service that can be
/// rebuilt here; otherwise the last known id is kept as deploy history.
pub fn apply_image_observations(manifest: &mut Manifest, observations: &[ImageObservation]) {
    for observation in observations {
        let Some(definition) = manifest.definition_mut(&observation.beamo_id) else {
            continue;
        };
        match &observation.image_id {
            Some(id) => definition.image_id = id.clone(),
            None if observation.rebuildable => definition.image_id.clear(),
            None => {}
        }
    }
}

/// Finds the service a container belongs to: by container name first, then by image id.
pub fn resolve_beamo_id(manifest: &Manifest, container: &ContainerDetails) -> Option<String> {
    let name = container.name.trim_start_matches('/');
    manifest
        .service_definitions
        .iter()
        .find(|sd| sd.container_name() == name)
        .or_else(|| {
            manifest
                .service_definitions
                .iter()
                .find(|sd| !sd.image_id.is_empty() && sd.image_id == container.image_id)
        })
        .map(|sd| sd.beamo_id.clone())
}

pub(crate) fn instance_from(beamo_id: String, container: &ContainerDetails) -> ServiceInstance {
    ServiceInstance {
        beamo_id,
        container_id: container.container_id.clone(),
        container_name: container.name.trim_start_matches('/').to_string(),
        image_id: container.image_id.clone(),
        active_port_bindings: container.port_bindings.clone(),
        is_running: container.is_running,
        created_at: container.created_at,
    }
}

/// Makes `runtime` match a full container listing: instances for vanished or unowned
/// containers are removed, the rest are upserted by container id.
pub fn apply_container_snapshot(manifest: &Manifest, runtime: &mut Runtime, containers: &[ContainerDetails]) {
    let since = runtime.begin_poll();
    apply_polled_snapshot(manifest, runtime, containers, since);
}

/// Applies a listing taken after `runtime.begin_poll()` returned `since`. Containers tracked
/// or removed after that point keep their current existence; the listing cannot see them.
pub fn apply_polled_snapshot(
    manifest: &Manifest,
    runtime: &mut Runtime,
    containers: &[ContainerDetails],
    since: u64,
) {
    let owned: Vec<(String, &ContainerDetails)> = containers
        .iter()
        .filter(|c| {
            !runtime.removed_since(&c.container_id, since) && !runtime.tracked_since(&c.container_id, since)
        })
        .filter_map(|c| resolve_beamo_id(manifest, c).map(|id| (id, c)))
        .collect();
    let live: HashSet<&str> = owned.iter().map(|(_, c)| c.container_id.as_str()).collect();

    let stale: Vec<String> = runtime
        .instances()
        .iter()
        .filter(|si| !live.contains(si.container_id.as_str()) && !runtime.tracked_since(&si.container_id, since))
        .map(|si| si.container_id.clone())
        .collect();
    runtime
        .existing_local_service_instances
        .retain(|si| !stale.contains(&si.container_id));

    for (beamo_id, container) in owned {
        runtime.upsert(instance_from(beamo_id, container));
    }
    runtime.finish_poll();
}

/// Applies one lifecycle event. `details` is the inspected container, needed to insert
/// an instance the runtime does not track yet.
pub fn apply_event(
    manifest: &Manifest,
    runtime: &mut Runtime,
    event: &ContainerEvent,
    details: Option<&ContainerDetails>,
) -> Option<ServiceStateChange> {
    let container_id = event.container_id.clone();
    match event.action {
        ContainerAction::Destroy => {
            let removed = runtime.remove_container(&event.container_id)?;
            Some(ServiceStateChange::Removed {
                beamo_id: removed.beamo_id,
                container_id,
            })
        }
        ContainerAction::Create | ContainerAction::Start | ContainerAction::Stop => {
            let running = match event.action {
                ContainerAction::Start => Some(true),
                ContainerAction::Stop => Some(false),
                _ => None,
            };
            let beamo_id = match runtime.find_by_container_id_mut(&event.container_id) {
                Some(existing) => {
                    if let Some(running) = running {
                        existing.is_running = running;
                    }
                    existing.beamo_id.clone()
                }
                None => {
                    let details = details?;
                    let beamo_id = resolve_beamo_id(manifest, details)?;
                    let mut instance = instance_from(beamo_id.clone(), details);
                    if let Some(running) = running {
                        instance.is_running = running;
                    }
                    runtime.track(instance);
                    beamo_id
                }
            };
            Some(match event.action {
                ContainerAction::Start => ServiceStateChange::Started { beamo_id, container_id },
                ContainerAction::Stop => ServiceStateChange::Stopped { beamo_id, container_id },
                _ => ServiceStateChange::Created { beamo_id, container_id },
            })
        }
    }
}

/// Full poll reconcile: refresh image ids, then rebuild the runtime from a container listing.
///
/// Every daemon call happens before any lock is taken; each aggregate is then updated under
/// a single write lock. Events applied while the listing is in flight win over it.
pub async fn synchronize(
    gateway: &dyn DaemonGateway,
    manifest: &RwLock<Manifest>,
    runtime: &RwLock<Runtime>,
) -> Result<()> {
    let snapshot = manifest.read().await.clone();
    let observations = observe_images(gateway, &snapshot).await?;
    let since = runtime.write().await.begin_poll();
    let containers = match gateway.list_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            runtime.write().await.finish_poll();
            return Err(e);
        }
    };

    let updated = {
        let mut manifest = manifest.write().await;
        apply_image_observations(&mut manifest, &observations);
        manifest.clone()
    };

    let mut runtime = runtime.write().await;
    apply_polled_snapshot(&updated, &mut runtime, &containers, since);
    debug!(
        containers = containers.len(),
        instances = runtime.instances().len(),
        "synchronized runtime"
    );
    info!(services = updated.service_definitions.len(), "local state synchronized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortBinding, ProtocolType, ServiceDefinition};

    fn manifest() -> Manifest {
        let mut svc = ServiceDefinition::new("svc", ProtocolType::HttpMicroservice);
        svc.image_id = "sha256:svc".into();
        let mut my_svc = ServiceDefinition::new("my_svc", ProtocolType::HttpMicroservice);
        my_svc.image_id = "sha256:mine".into();
        let db = ServiceDefinition::new("db", ProtocolType::EmbeddedMongoDb);
        Manifest {
            service_definitions: vec![svc, my_svc, db],
            ..Default::default()
        }
    }

    fn container(id: &str, name: &str, image: &str, running: bool) -> ContainerDetails {
        ContainerDetails {
            container_id: id.into(),
            name: name.into(),
            image_id: image.into(),
            is_running: running,
            created_at: None,
            port_bindings: vec![PortBinding {
                local_port: "8080".into(),
                in_container_port: "6565".into(),
            }],
        }
    }

    #[test]
    fn resolve_by_name_then_image() {
        let m = manifest();
        assert_eq!(
            resolve_beamo_id(&m, &container("1", "/my_svc_httpMicroservice", "sha256:x", true)).as_deref(),
            Some("my_svc")
        );
        assert_eq!(
            resolve_beamo_id(&m, &container("2", "db_storage", "sha256:y", true)).as_deref(),
            Some("db")
        );
        assert_eq!(
            resolve_beamo_id(&m, &container("3", "random_name", "sha256:svc", true)).as_deref(),
            Some("svc")
        );
        assert_eq!(resolve_beamo_id(&m, &container("4", "other", "sha256:z", true)), None);
    }

    #[test]
    fn snapshot_upserts_and_removes() {
        let m = manifest();
        let mut runtime = Runtime::default();
        apply_container_snapshot(
            &m,
            &mut runtime,
            &[
                container("a", "svc_httpMicroservice", "sha256:svc", true),
                container("b", "db_storage", "sha256:m", true),
                container("c", "unrelated", "sha256:z", true),
            ],
        );
        assert_eq!(runtime.instances().len(), 2);

        apply_container_snapshot(&m, &mut runtime, &[container("b", "db_storage", "sha256:m", false)]);
        assert_eq!(runtime.instances().len(), 1);
        assert!(!runtime.instances()[0].is_running);
    }

    #[test]
    fn snapshot_is_idempotent() {
        let m = manifest();
        let containers = vec![
            container("a", "svc_httpMicroservice", "sha256:svc", true),
            container("b", "db_storage", "sha256:m", false),
        ];
        let mut runtime = Runtime::default();
        apply_container_snapshot(&m, &mut runtime, &containers);
        let first = runtime.clone();
        apply_container_snapshot(&m, &mut runtime, &containers);
        assert!(first.same_state(&runtime));
    }

    #[test]
    fn externally_stopped_container_stays_tracked() {
        let m = manifest();
        let running = container("a", "svc_httpMicroservice", "sha256:svc", true);
        let stopped = container("a", "svc_httpMicroservice", "sha256:svc", false);

        let mut polled = Runtime::default();
        apply_container_snapshot(&m, &mut polled, std::slice::from_ref(&running));
        apply_container_snapshot(&m, &mut polled, std::slice::from_ref(&stopped));

        let mut evented = Runtime::default();
        apply_container_snapshot(&m, &mut evented, std::slice::from_ref(&running));
        let change = apply_event(&m, &mut evented, &ContainerEvent::new("a", ContainerAction::Stop), None);
        assert_eq!(
            change,
            Some(ServiceStateChange::Stopped {
                beamo_id: "svc".into(),
                container_id: "a".into()
            })
        );

        for runtime in [&polled, &evented] {
            assert_eq!(runtime.instances().len(), 1);
            assert!(!runtime.instances()[0].is_running);
        }
        assert!(polled.same_state(&evented));
    }

    #[test]
    fn event_path_converges_with_poll() {
        let m = manifest();
        let created = container("a", "svc_httpMicroservice", "sha256:svc", false);
        let mut evented = Runtime::default();
        apply_event(&m, &mut evented, &ContainerEvent::new("a", ContainerAction::Create), Some(&created));
        apply_event(&m, &mut evented, &ContainerEvent::new("a", ContainerAction::Start), None);

        let mut polled = Runtime::default();
        apply_container_snapshot(&m, &mut polled, &[container("a", "svc_httpMicroservice", "sha256:svc", true)]);
        assert!(polled.same_state(&evented));

        let change = apply_event(&m, &mut evented, &ContainerEvent::new("a", ContainerAction::Destroy), None);
        assert!(matches!(change, Some(ServiceStateChange::Removed { .. })));
        assert!(evented.instances().is_empty());
        // A repeated destroy leaves nothing behind and reports nothing.
        assert_eq!(
            apply_event(&m, &mut evented, &ContainerEvent::new("a", ContainerAction::Destroy), None),
            None
        );
    }

    #[test]
    fn listing_taken_before_destroy_does_not_revive_container() {
        let m = manifest();
        let listed = container("a", "svc_httpMicroservice", "sha256:svc", true);
        let mut runtime = Runtime::default();
        apply_container_snapshot(&m, &mut runtime, std::slice::from_ref(&listed));

        let since = runtime.begin_poll();
        apply_event(&m, &mut runtime, &ContainerEvent::new("a", ContainerAction::Destroy), None);
        apply_polled_snapshot(&m, &mut runtime, std::slice::from_ref(&listed), since);
        assert!(runtime.instances().is_empty());
    }

    #[test]
    fn listing_taken_before_create_keeps_new_container() {
        let m = manifest();
        let mut runtime = Runtime::default();

        let since = runtime.begin_poll();
        let created = container("b", "db_storage", "sha256:m", false);
        apply_event(&m, &mut runtime, &ContainerEvent::new("b", ContainerAction::Create), Some(&created));
        apply_polled_snapshot(&m, &mut runtime, &[], since);
        assert_eq!(runtime.instances().len(), 1);

        // A listing taken afterwards is authoritative again.
        apply_container_snapshot(&m, &mut runtime, &[]);
        assert!(runtime.instances().is_empty());
    }

    #[test]
    fn start_for_untracked_container_inserts_running() {
        let m = manifest();
        let mut runtime = Runtime::default();
        let details = container("z", "db_storage", "sha256:m", false);
        apply_event(&m, &mut runtime, &ContainerEvent::new("z", ContainerAction::Start), Some(&details));
        assert!(runtime.is_service_running("db"));
    }

    #[test]
    fn unowned_containers_are_ignored_by_events() {
        let m = manifest();
        let mut runtime = Runtime::default();
        let details = container("q", "postgres", "sha256:pg", true);
        let change = apply_event(&m, &mut runtime, &ContainerEvent::new("q", ContainerAction::Create), Some(&details));
        assert_eq!(change, None);
        assert!(runtime.instances().is_empty());
    }

    #[test]
    fn missing_image_clears_only_rebuildable() {
        let mut m = manifest();
        apply_image_observations(
            &mut m,
            &[
                ImageObservation {
                    beamo_id: "svc".into(),
                    image_id: None,
                    rebuildable: true,
                },
                ImageObservation {
                    beamo_id: "my_svc".into(),
                    image_id: None,
                    rebuildable: false,
                },
                ImageObservation {
                    beamo_id: "db".into(),
                    image_id: Some("sha256:mongo".into()),
                    rebuildable: true,
                },
            ],
        );
        assert_eq!(m.definition("svc").unwrap().image_id, "");
        assert_eq!(m.definition("my_svc").unwrap().image_id, "sha256:mine");
        assert_eq!(m.definition("db").unwrap().image_id, "sha256:mongo");
    }
}
