// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{head, post, put};
use axum::Router;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use beamo_core::models::{
    BeamoConfig, BuildRequest, ContainerDetails, ContainerEvent, ContainerSpec,
    EmbeddedMongoDbLocalProtocol, EmbeddedMongoDbRemoteProtocol, HttpMicroserviceLocalProtocol,
    HttpMicroserviceRemoteProtocol, LocalProtocol, ProgressFn, ProtocolType, RemoteProtocol,
    ServiceDefinition, UploadConfig,
};
use beamo_core::services::upload::sha256_digest;
use beamo_core::services::DaemonGateway;
use beamo_core::{BeamoError, DaemonErrorKind, Result};

// ---------------------------------------------------------------------------
// Fake daemon
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DaemonState {
    containers: BTreeMap<String, ContainerDetails>,
    /// Image reference (tag or id) to image id.
    images: HashMap<String, String>,
    next_container: usize,
    builds: usize,
    pulls: usize,
    creates: usize,
    removed_containers: usize,
    removed_images: Vec<String>,
    /// Container names in the order they were started.
    started: Vec<String>,
    events: Option<mpsc::Sender<ContainerEvent>>,
    subscriptions: usize,
    /// Container names whose start fails.
    failing_starts: HashSet<String>,
    listing_hold: Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>,
}

/// Pauses one `list_containers` call after it has read the containers. `listed` fires at
/// that point; the call returns its (now stale) listing once `release` is sent.
pub struct ListingHold {
    pub listed: oneshot::Receiver<()>,
    pub release: oneshot::Sender<()>,
}

/// In-memory container daemon. Builds and pulls resolve to stable image ids, so
/// repeated deploys of unchanged services see the same image.
#[derive(Default)]
pub struct FakeDaemon {
    state: Mutex<DaemonState>,
    archive: Vec<u8>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// A daemon whose `export_image` returns `archive`.
    pub fn with_archive(archive: Vec<u8>) -> Self {
        Self {
            state: Mutex::default(),
            archive,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap()
    }

    pub fn add_image(&self, reference: &str, image_id: &str) {
        let mut state = self.state();
        state.images.insert(reference.into(), image_id.into());
        state.images.insert(image_id.into(), image_id.into());
    }

    pub fn add_container(&self, details: ContainerDetails) {
        self.state()
            .containers
            .insert(details.container_id.clone(), details);
    }

    pub fn set_running(&self, container_id: &str, running: bool) {
        if let Some(c) = self.state().containers.get_mut(container_id) {
            c.is_running = running;
        }
    }

    pub fn drop_container(&self, container_id: &str) {
        self.state().containers.remove(container_id);
    }

    pub fn containers(&self) -> Vec<ContainerDetails> {
        self.state().containers.values().cloned().collect()
    }

    pub fn container_named(&self, name: &str) -> Option<ContainerDetails> {
        self.state().containers.values().find(|c| c.name == name).cloned()
    }

    pub fn builds(&self) -> usize {
        self.state().builds
    }

    pub fn pulls(&self) -> usize {
        self.state().pulls
    }

    pub fn creates(&self) -> usize {
        self.state().creates
    }

    pub fn removed_containers(&self) -> usize {
        self.state().removed_containers
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.state().subscriptions
    }

    pub fn fail_start(&self, container_name: &str) {
        self.state().failing_starts.insert(container_name.to_string());
    }

    pub fn hold_next_listing(&self) -> ListingHold {
        let (listed_tx, listed) = oneshot::channel();
        let (release, release_rx) = oneshot::channel();
        self.state().listing_hold = Some((listed_tx, release_rx));
        ListingHold { listed, release }
    }

    /// Ends the event stream, as when the daemon goes away.
    pub fn close_events(&self) {
        self.state().events = None;
    }

    /// Pushes an event into the most recent subscription.
    pub async fn emit(&self, event: ContainerEvent) {
        let tx = self.state().events.clone().expect("no active subscription");
        tx.send(event).await.unwrap();
    }

    fn missing_container(id: &str) -> BeamoError {
        BeamoError::daemon(DaemonErrorKind::NoSuchContainer, format!("No such container: {id}"))
    }

    fn register_image(&self, reference: &str, image_id: String) -> String {
        let mut state = self.state();
        state.images.insert(reference.to_string(), image_id.clone());
        state.images.insert(image_id.clone(), image_id.clone());
        image_id
    }
}

#[async_trait]
impl DaemonGateway for FakeDaemon {
    async fn list_containers(&self) -> Result<Vec<ContainerDetails>> {
        let (containers, hold) = {
            let mut state = self.state();
            let containers: Vec<_> = state.containers.values().cloned().collect();
            (containers, state.listing_hold.take())
        };
        if let Some((listed, release)) = hold {
            let _ = listed.send(());
            let _ = release.await;
        }
        Ok(containers)
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails> {
        self.state()
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| Self::missing_container(container_id))
    }

    async fn inspect_image(&self, reference: &str) -> Result<String> {
        self.state().images.get(reference).cloned().ok_or_else(|| {
            BeamoError::daemon(DaemonErrorKind::NoSuchImage, format!("No such image: {reference}"))
        })
    }

    async fn build_image(&self, request: &BuildRequest, progress: ProgressFn<'_>) -> Result<String> {
        self.state().builds += 1;
        progress(0.5);
        progress(1.0);
        Ok(self.register_image(&request.tag, format!("sha256:{:0<64}", hex_of(&request.tag))))
    }

    async fn pull_image(&self, reference: &str, progress: ProgressFn<'_>) -> Result<String> {
        self.state().pulls += 1;
        progress(1.0);
        Ok(self.register_image(reference, format!("sha256:{:0<64}", hex_of(reference))))
    }

    async fn export_image(&self, image_id: &str) -> Result<Vec<u8>> {
        if !self.state().images.contains_key(image_id) {
            return Err(BeamoError::daemon(DaemonErrorKind::NoSuchImage, image_id));
        }
        Ok(self.archive.clone())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(BeamoError::daemon(
                DaemonErrorKind::Conflict,
                format!("name {} is already in use", spec.name),
            ));
        }
        state.next_container += 1;
        state.creates += 1;
        let container_id = format!("c{:04}", state.next_container);
        let image_id = state
            .images
            .get(&spec.image)
            .cloned()
            .unwrap_or_else(|| spec.image.clone());
        state.containers.insert(
            container_id.clone(),
            ContainerDetails {
                container_id: container_id.clone(),
                name: spec.name.clone(),
                image_id,
                is_running: false,
                created_at: Some(chrono::Utc::now()),
                port_bindings: spec.port_bindings.clone(),
            },
        );
        Ok(container_id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        let state = &mut *state;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Self::missing_container(container_id))?;
        if state.failing_starts.contains(&container.name) {
            return Err(BeamoError::daemon(
                DaemonErrorKind::Failed,
                format!("failed to start {}", container.name),
            ));
        }
        container.is_running = true;
        state.started.push(container.name.clone());
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Self::missing_container(container_id))?;
        container.is_running = false;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        let key = state
            .containers
            .values()
            .find(|c| c.container_id == container_id || c.name == container_id)
            .map(|c| c.container_id.clone())
            .ok_or_else(|| Self::missing_container(container_id))?;
        state.containers.remove(&key);
        state.removed_containers += 1;
        Ok(())
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        let mut state = self.state();
        let before = state.images.len();
        state.images.retain(|_, id| id != image_id);
        if state.images.len() == before {
            return Err(BeamoError::daemon(DaemonErrorKind::NoSuchImage, image_id));
        }
        state.removed_images.push(image_id.to_string());
        Ok(())
    }

    async fn subscribe_events(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<ContainerEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state();
        state.events = Some(tx);
        state.subscriptions += 1;
        Ok(rx)
    }
}

fn hex_of(text: &str) -> String {
    text.bytes().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Manifest builders
// ---------------------------------------------------------------------------

/// An HTTP service buildable from `context`, which gets a Dockerfile written into it.
pub fn http_service(
    beamo_id: &str,
    context: &Path,
    depends_on: &[&str],
) -> (ServiceDefinition, LocalProtocol, RemoteProtocol) {
    std::fs::write(context.join("Dockerfile"), "FROM scratch\n").unwrap();
    (
        ServiceDefinition::new(beamo_id, ProtocolType::HttpMicroservice)
            .with_dependencies(depends_on.iter().copied()),
        LocalProtocol::HttpMicroservice(HttpMicroserviceLocalProtocol {
            docker_build_context_path: Some(context.to_string_lossy().into_owned()),
            relative_dockerfile_path: Some("Dockerfile".into()),
            ..Default::default()
        }),
        RemoteProtocol::HttpMicroservice(HttpMicroserviceRemoteProtocol::default()),
    )
}

pub fn mongo_storage(beamo_id: &str) -> (ServiceDefinition, LocalProtocol, RemoteProtocol) {
    (
        ServiceDefinition::new(beamo_id, ProtocolType::EmbeddedMongoDb),
        LocalProtocol::EmbeddedMongoDb(EmbeddedMongoDbLocalProtocol::default()),
        RemoteProtocol::EmbeddedMongoDb(EmbeddedMongoDbRemoteProtocol {}),
    )
}

// ---------------------------------------------------------------------------
// Image archives
// ---------------------------------------------------------------------------

/// An `image save` style archive with the given config and layer contents.
pub fn image_archive(config: &[u8], layers: &[&[u8]]) -> Vec<u8> {
    let layer_paths: Vec<String> = (0..layers.len()).map(|i| format!("layer{i}/layer.tar")).collect();
    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": ["svc:latest"],
        "Layers": layer_paths,
    }]);
    let manifest = serde_json::to_vec(&manifest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut append = |path: &str, data: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    };
    append("manifest.json", &manifest);
    append("config.json", config);
    for (path, data) in layer_paths.iter().zip(layers) {
        append(path, data);
    }
    builder.into_inner().unwrap()
}

// ---------------------------------------------------------------------------
// Fake registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RegistryState {
    pub blobs: HashSet<String>,
    sessions: HashMap<String, Vec<u8>>,
    next_session: usize,
    pub heads: usize,
    pub posts: usize,
    pub patches: usize,
    pub blob_puts: usize,
    /// `Content-Range` of each blob PUT, in arrival order.
    pub put_ranges: Vec<String>,
    /// `(reference, body)` of each manifest PUT.
    pub manifests: Vec<(String, serde_json::Value)>,
    pub auth_headers: Vec<Option<String>>,
    pub reject_manifest: bool,
}

pub type SharedRegistry = Arc<Mutex<RegistryState>>;

pub struct FakeRegistry {
    pub addr: SocketAddr,
    pub state: SharedRegistry,
}

impl FakeRegistry {
    /// Serves a minimal registry v2 blob and manifest API on a random local port.
    pub async fn start() -> Self {
        let state = SharedRegistry::default();
        let app = Router::new()
            .route("/v2/{repo}/blobs/{digest}", head(head_blob))
            .route("/v2/{repo}/blobs/uploads/", post(start_upload))
            .route(
                "/v2/{repo}/blobs/uploads/{session}",
                put(finish_upload).patch(append_chunk),
            )
            .route("/v2/{repo}/manifests/{reference}", put(put_manifest))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn registry_url(&self) -> String {
        format!("http://{}/v2/", self.addr)
    }

    pub fn preload(&self, data: &[u8]) {
        self.state.lock().unwrap().blobs.insert(sha256_digest(data));
    }

    pub fn reject_manifests(&self) {
        self.state.lock().unwrap().reject_manifest = true;
    }

    pub fn snapshot<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    /// Config pointing at this registry over plain HTTP.
    pub fn config(&self, chunk_size: Option<usize>) -> BeamoConfig {
        BeamoConfig {
            registry_url: self.registry_url(),
            cid: "1337".into(),
            pid: "DE_1".into(),
            access_token: Some("token".into()),
            upload: UploadConfig {
                force_https: false,
                chunk_size,
                timeout_secs: 10,
            },
            ..Default::default()
        }
    }
}

async fn head_blob(
    State(state): State<SharedRegistry>,
    UrlPath((_repo, digest)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    let mut state = state.lock().unwrap();
    state.heads += 1;
    state.auth_headers.push(
        headers
            .get("x-ks-clientid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    if state.blobs.contains(&digest) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

fn session_location(repo: &str, session: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("/v2/{repo}/blobs/uploads/{session}")).unwrap()
}

async fn start_upload(State(state): State<SharedRegistry>, UrlPath(repo): UrlPath<String>) -> Response {
    let mut state = state.lock().unwrap();
    state.posts += 1;
    state.next_session += 1;
    let session = format!("s{}", state.next_session);
    state.sessions.insert(session.clone(), Vec::new());
    (
        StatusCode::ACCEPTED,
        [(axum::http::header::LOCATION, session_location(&repo, &session))],
    )
        .into_response()
}

async fn append_chunk(
    State(state): State<SharedRegistry>,
    UrlPath((repo, session)): UrlPath<(String, String)>,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    state.patches += 1;
    let Some(data) = state.sessions.get_mut(&session) else {
        return (StatusCode::NOT_FOUND, "unknown upload session").into_response();
    };
    data.extend_from_slice(&body);
    (
        StatusCode::ACCEPTED,
        [(axum::http::header::LOCATION, session_location(&repo, &session))],
    )
        .into_response()
}

async fn finish_upload(
    State(state): State<SharedRegistry>,
    UrlPath((_repo, session)): UrlPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    state.blob_puts += 1;
    if let Some(range) = headers
        .get(axum::http::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        state.put_ranges.push(range.to_string());
    }
    let Some(mut data) = state.sessions.remove(&session) else {
        return (StatusCode::NOT_FOUND, "unknown upload session").into_response();
    };
    data.extend_from_slice(&body);
    let Some(digest) = query.get("digest") else {
        return (StatusCode::BAD_REQUEST, "digest missing").into_response();
    };
    if &sha256_digest(&data) != digest {
        return (StatusCode::BAD_REQUEST, "digest mismatch").into_response();
    }
    state.blobs.insert(digest.clone());
    StatusCode::CREATED.into_response()
}

async fn put_manifest(
    State(state): State<SharedRegistry>,
    UrlPath((_repo, reference)): UrlPath<(String, String)>,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    if state.reject_manifest {
        return (StatusCode::INTERNAL_SERVER_ERROR, "manifest rejected by registry").into_response();
    }
    let manifest: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let layers = manifest["layers"].as_array().cloned().unwrap_or_default();
    let missing = std::iter::once(&manifest["config"])
        .chain(layers.iter())
        .filter_map(|d| d["digest"].as_str())
        .any(|digest| !state.blobs.contains(digest));
    if missing {
        return (StatusCode::BAD_REQUEST, "manifest references unknown blob").into_response();
    }
    state.manifests.push((reference, manifest));
    StatusCode::CREATED.into_response()
}
