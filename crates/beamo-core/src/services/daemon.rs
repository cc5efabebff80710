use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{BuildRequest, ContainerDetails, ContainerEvent, ContainerSpec, ProgressFn};

/// The container daemon operations the orchestrator depends on.
///
/// Failures come back as [`crate::BeamoError::Daemon`] with a typed
/// [`crate::DaemonErrorKind`], so callers never inspect message text.
#[async_trait]
pub trait DaemonGateway: Send + Sync {
    /// Every container on the daemon, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerDetails>>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails>;

    /// Resolves an image reference to its image id.
    async fn inspect_image(&self, reference: &str) -> Result<String>;

    /// Builds an image and returns its id.
    async fn build_image(&self, request: &BuildRequest, progress: ProgressFn<'_>) -> Result<String>;

    /// Pulls an image and returns its id.
    async fn pull_image(&self, reference: &str, progress: ProgressFn<'_>) -> Result<String>;

    /// The `image save` tar archive for an image.
    async fn export_image(&self, image_id: &str) -> Result<Vec<u8>>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Force-removes a container, running or not.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn remove_image(&self, image_id: &str) -> Result<()>;

    /// Streams container lifecycle events until `cancel` fires or the receiver is dropped.
    async fn subscribe_events(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<ContainerEvent>>;
}
