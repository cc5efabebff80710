use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{ContainerAction, ContainerEvent, Manifest, Runtime, ServiceStateChange};
use crate::services::daemon::DaemonGateway;
use crate::services::reconcile::apply_event;

/// Subscription handle for the running event task.
struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps the runtime current from the daemon's event stream.
///
/// At most one subscription is active; starting again replaces the previous one.
#[derive(Default)]
pub struct EventListener {
    active: Mutex<Option<Subscription>>,
}

impl EventListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes and applies events in the background. If the daemon closes the stream,
    /// `changes` receives [`ServiceStateChange::SubscriptionEnded`] before it is dropped.
    pub async fn start(
        &self,
        gateway: Arc<dyn DaemonGateway>,
        manifest: Arc<RwLock<Manifest>>,
        runtime: Arc<RwLock<Runtime>>,
        changes: Option<mpsc::UnboundedSender<ServiceStateChange>>,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("replacing active event subscription");
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let cancel = CancellationToken::new();
        let mut events = gateway.subscribe_events(cancel.clone()).await?;
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            let change = handle_event(gateway.as_ref(), &manifest, &runtime, &event).await;
                            if let (Some(change), Some(tx)) = (change, changes.as_ref()) {
                                let _ = tx.send(change);
                            }
                        }
                        None => {
                            warn!("daemon event stream ended, runtime is no longer tracked");
                            if let Some(tx) = changes.as_ref() {
                                let _ = tx.send(ServiceStateChange::SubscriptionEnded);
                            }
                            break;
                        }
                    },
                }
            }
            debug!("event subscription finished");
        });

        info!("listening for container events");
        *active = Some(Subscription { cancel, task });
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(subscription) = self.active.lock().await.take() {
            subscription.cancel.cancel();
            let _ = subscription.task.await;
            info!("stopped listening for container events");
        }
    }

    /// False once stopped, or once the daemon ended the stream.
    pub async fn is_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }
}

/// Events are applied one at a time, so a container's create can never land after its destroy.
async fn handle_event(
    gateway: &dyn DaemonGateway,
    manifest: &RwLock<Manifest>,
    runtime: &RwLock<Runtime>,
    event: &ContainerEvent,
) -> Option<ServiceStateChange> {
    let needs_details = match event.action {
        ContainerAction::Create => true,
        ContainerAction::Start | ContainerAction::Stop => runtime
            .read()
            .await
            .find_by_container_id(&event.container_id)
            .is_none(),
        ContainerAction::Destroy => false,
    };

    let details = if needs_details {
        match gateway.inspect_container(&event.container_id).await {
            Ok(details) => Some(details),
            Err(e) => {
                if e.daemon_kind().is_some_and(|k| k.is_missing()) {
                    debug!(container = %event.container_id, "container gone before inspect");
                } else {
                    warn!(container = %event.container_id, error = %e, "failed to inspect container");
                }
                None
            }
        }
    } else {
        None
    };

    let manifest = manifest.read().await;
    let mut runtime = runtime.write().await;
    let change = apply_event(&manifest, &mut runtime, event, details.as_ref());
    if let Some(change) = &change {
        debug!(change = ?change, "runtime updated from event");
    }
    change
}
