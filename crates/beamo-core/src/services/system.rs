use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{BeamoError, Result};
use crate::models::{
    BeamoConfig, DeployEvent, LocalProtocol, Manifest, RemoteProtocol, Runtime, ServiceDefinition,
    ServiceStateChange, UploadReport,
};
use crate::services::daemon::DaemonGateway;
use crate::services::docker_cli::DockerCli;
use crate::services::listener::EventListener;
use crate::services::state::StateStore;
use crate::services::upload::RegistryUploader;
use crate::services::{deploy, reconcile, teardown};

/// Owns the desired and observed state of one local workspace and every operation on it.
pub struct BeamoSystem {
    config: BeamoConfig,
    gateway: Arc<dyn DaemonGateway>,
    manifest: Arc<RwLock<Manifest>>,
    runtime: Arc<RwLock<Runtime>>,
    state_store: StateStore,
    listener: EventListener,
}

impl BeamoSystem {
    pub fn new(state_directory: &Path, config: BeamoConfig, gateway: Arc<dyn DaemonGateway>) -> Self {
        Self {
            config,
            gateway,
            manifest: Arc::new(RwLock::new(Manifest::default())),
            runtime: Arc::new(RwLock::new(Runtime::default())),
            state_store: StateStore::new(state_directory),
            listener: EventListener::new(),
        }
    }

    /// A system talking to the local daemon through the configured `docker` binary.
    pub fn with_docker(state_directory: &Path, config: BeamoConfig) -> Self {
        let gateway = Arc::new(DockerCli::new(config.docker_path.clone()));
        Self::new(state_directory, config, gateway)
    }

    pub fn config(&self) -> &BeamoConfig {
        &self.config
    }

    /// Load persisted manifest and runtime.
    pub async fn load_state(&self) -> Result<()> {
        let manifest = self.state_store.load_manifest().await?;
        manifest.validate()?;
        let runtime = self.state_store.load_runtime().await?;
        *self.manifest.write().await = manifest;
        *self.runtime.write().await = runtime;
        Ok(())
    }

    pub async fn save_state(&self) -> Result<()> {
        let manifest = self.manifest.read().await.clone();
        let runtime = self.runtime.read().await.clone();
        self.state_store.save_manifest(&manifest).await?;
        self.state_store.save_runtime(&runtime).await
    }

    /// Snapshot of the desired state.
    pub async fn get_manifest(&self) -> Manifest {
        self.manifest.read().await.clone()
    }

    /// Snapshot of the observed state.
    pub async fn get_runtime(&self) -> Runtime {
        self.runtime.read().await.clone()
    }

    pub async fn add_service(
        &self,
        definition: ServiceDefinition,
        local: LocalProtocol,
        remote: RemoteProtocol,
    ) -> Result<()> {
        self.manifest
            .write()
            .await
            .add_definition(definition, local, remote)?;
        self.save_state().await
    }

    pub async fn synchronize(&self) -> Result<()> {
        reconcile::synchronize(self.gateway.as_ref(), &self.manifest, &self.runtime).await?;
        self.save_state().await
    }

    /// Keeps the runtime current from daemon events until [`Self::stop_listening`].
    pub async fn start_listening(&self, changes: Option<mpsc::UnboundedSender<ServiceStateChange>>) -> Result<()> {
        self.listener
            .start(
                self.gateway.clone(),
                self.manifest.clone(),
                self.runtime.clone(),
                changes,
            )
            .await
    }

    pub async fn stop_listening(&self) {
        self.listener.stop().await;
    }

    pub async fn is_listening(&self) -> bool {
        self.listener.is_active().await
    }

    /// Reconciles, deploys the targets (all services when `None`), then persists.
    pub async fn deploy(
        &self,
        target_ids: Option<&[String]>,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<DeployEvent>>,
    ) -> Result<()> {
        reconcile::synchronize(self.gateway.as_ref(), &self.manifest, &self.runtime).await?;
        let result = deploy::deploy(
            self.gateway.as_ref(),
            &self.manifest,
            &self.runtime,
            target_ids,
            cancel,
            events,
        )
        .await;
        // Partial progress is kept on failure, so persist either way.
        self.save_state().await?;
        result
    }

    /// Pushes the service's current image to the registry.
    pub async fn upload(
        &self,
        beamo_id: &str,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<f32>>,
    ) -> Result<UploadReport> {
        let image_id = {
            let manifest = self.manifest.read().await;
            let definition = manifest
                .definition(beamo_id)
                .ok_or_else(|| BeamoError::UnknownService(beamo_id.to_string()))?;
            definition.image_id.clone()
        };
        if image_id.is_empty() {
            return Err(BeamoError::NotBuildable {
                beamo_id: beamo_id.to_string(),
                reason: "no local image, deploy it first".into(),
            });
        }
        let uploader = RegistryUploader::new(&self.config)?;
        uploader
            .upload(self.gateway.as_ref(), beamo_id, &image_id, cancel, progress)
            .await
    }

    pub async fn stop_service(&self, beamo_id: &str) -> Result<()> {
        teardown::stop_service(self.gateway.as_ref(), &self.runtime, beamo_id).await?;
        self.save_state().await
    }

    pub async fn remove_containers(&self, beamo_id: &str) -> Result<()> {
        teardown::remove_containers(self.gateway.as_ref(), &self.runtime, beamo_id).await?;
        self.save_state().await
    }

    pub async fn clean_up(&self, beamo_id: &str) -> Result<()> {
        teardown::clean_up(self.gateway.as_ref(), &self.manifest, &self.runtime, beamo_id).await?;
        self.save_state().await
    }

    pub async fn is_service_running(&self, beamo_id: &str) -> bool {
        self.runtime.read().await.is_service_running(beamo_id)
    }

    pub async fn is_container_running(&self, beamo_id: &str, container_name: &str) -> bool {
        self.runtime
            .read()
            .await
            .is_container_running(beamo_id, container_name)
    }
}
