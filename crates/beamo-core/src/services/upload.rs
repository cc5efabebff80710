use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::try_join_all;
use futures::stream;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{BeamoError, Result};
use crate::models::registry::{CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};
use crate::models::service::truncate_image_id;
use crate::models::{BeamoConfig, BlobDescriptor, UploadConfig, UploadManifest, UploadReport};
use crate::services::daemon::DaemonGateway;
use crate::services::image_archive::{read_image_archive, ArchiveBlob};

/// Registries cap repository name length.
const REPOSITORY_NAME_LEN: usize = 30;

/// Body chunk size for whole-blob uploads; progress is reported once per chunk.
const STREAM_CHUNK: usize = 16 * 1024;

const IN_FLIGHT_MAX: f32 = 0.99;

// Phase weights of the overall progress value.
const EXPORT_DONE: f32 = 0.05;
const CONFIG_WEIGHT: f32 = 0.05;
const LAYERS_START: f32 = 0.10;
const LAYERS_WEIGHT: f32 = 0.85;

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Registry repository for a service: a stable hash of realm and service, cut to the
/// registry's name limit.
pub fn repository_name(cid: &str, pid: &str, beamo_id: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(format!("{cid}_{pid}_{beamo_id}").as_bytes()));
    hash[..REPOSITORY_NAME_LEN].to_string()
}

/// Turns an upload `Location` into the URL to send the blob to. Relative locations resolve
/// against `base`; `force_https` rewrites the scheme and drops any explicit port.
pub fn normalize_upload_location(base: &Url, location: &str, digest: &str, force_https: bool) -> Result<Url> {
    let mut url = base.join(location)?;
    if force_https {
        let unusable = || BeamoError::InvalidConfig(format!("registry returned unusable upload location {location}"));
        url.set_scheme("https").map_err(|_| unusable())?;
        url.set_port(None).map_err(|_| unusable())?;
    }
    url.query_pairs_mut().append_pair("digest", digest);
    Ok(url)
}

/// Non-decreasing progress in `[0, 1]`. Stays below 1 until [`ProgressReporter::finish`].
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<f32>>,
    last: Mutex<f32>,
}

impl ProgressReporter {
    pub fn new(tx: Option<mpsc::UnboundedSender<f32>>) -> Self {
        Self {
            tx,
            last: Mutex::new(0.0),
        }
    }

    pub fn report(&self, value: f32) {
        let value = value.clamp(0.0, IN_FLIGHT_MAX);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if value > *last {
            *last = value;
            self.send(value);
        }
    }

    pub fn finish(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = 1.0;
        self.send(1.0);
    }

    pub fn current(&self) -> f32 {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, value: f32) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(value);
        }
    }
}

type BytesSent = Arc<dyn Fn(u64) + Send + Sync>;

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(BeamoError::Registry {
        status: status.as_u16(),
        url,
        body,
    })
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BeamoError::Cancelled);
    }
    Ok(())
}

/// Pushes locally built images to the service registry.
pub struct RegistryUploader {
    client: Client,
    registry_url: String,
    cid: String,
    pid: String,
    settings: UploadConfig,
}

impl RegistryUploader {
    /// Builds the HTTP session. Auth headers are attached to every request it makes.
    pub fn new(config: &BeamoConfig) -> Result<Self> {
        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| BeamoError::InvalidConfig(format!("invalid registry auth header: {e}")))
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-ks-clientid", header(&config.cid)?);
        headers.insert("x-ks-projectid", header(&config.pid)?);
        if let Some(token) = &config.access_token {
            headers.insert("x-ks-token", header(token)?);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.upload.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            registry_url: config.registry_url.clone(),
            cid: config.cid.clone(),
            pid: config.pid.clone(),
            settings: config.upload.clone(),
        })
    }

    pub fn repository_url(&self, beamo_id: &str) -> Result<Url> {
        let name = repository_name(&self.cid, &self.pid, beamo_id);
        Ok(Url::parse(&format!("{}{name}/", self.registry_url))?)
    }

    /// Exports `image_id` from the daemon and pushes its config, layers and manifest. The
    /// manifest is tagged with the truncated image id.
    ///
    /// Blobs the registry already has are skipped, so re-running after a failure only sends
    /// what is missing. The manifest goes up only after every blob is confirmed.
    pub async fn upload(
        &self,
        gateway: &dyn DaemonGateway,
        beamo_id: &str,
        image_id: &str,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<f32>>,
    ) -> Result<UploadReport> {
        let reporter = Arc::new(ProgressReporter::new(progress));
        let base = self.repository_url(beamo_id)?;
        info!(service = beamo_id, image = image_id, repository = %base, "uploading image");

        reporter.report(0.02);
        let exported = gateway.export_image(image_id).await?;
        reporter.report(0.04);
        let archive = tokio::task::spawn_blocking(move || read_image_archive(&exported))
            .await
            .map_err(|e| BeamoError::Archive(format!("archive reader failed: {e}")))??;
        reporter.report(EXPORT_DONE);
        checkpoint(cancel)?;

        let config_reporter = reporter.clone();
        let config_size = archive.config.data.len().max(1) as f32;
        let config_sent = Arc::new(AtomicU64::new(0));
        let on_config: BytesSent = Arc::new(move |bytes: u64| {
            let sent = config_sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
            config_reporter.report(EXPORT_DONE + CONFIG_WEIGHT * (sent as f32 / config_size));
        });
        let (config, config_skipped) = self
            .upload_blob(&base, &archive.config, CONFIG_MEDIA_TYPE, on_config)
            .await?;
        checkpoint(cancel)?;

        let total = archive.total_layer_bytes().max(1) as f32;
        let layers_sent = Arc::new(AtomicU64::new(0));
        let uploads = archive.layers.iter().map(|layer| {
            let reporter = reporter.clone();
            let layers_sent = layers_sent.clone();
            let on_layer: BytesSent = Arc::new(move |bytes: u64| {
                let sent = layers_sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
                reporter.report(LAYERS_START + LAYERS_WEIGHT * (sent as f32 / total));
            });
            self.upload_blob(&base, layer, LAYER_MEDIA_TYPE, on_layer)
        });
        let layer_results = try_join_all(uploads).await?;
        reporter.report(LAYERS_START + LAYERS_WEIGHT);
        checkpoint(cancel)?;

        let mut skipped_blobs = Vec::new();
        if config_skipped {
            skipped_blobs.push(config.digest.clone());
        }
        let mut layers = Vec::with_capacity(layer_results.len());
        for (descriptor, skipped) in layer_results {
            if skipped {
                skipped_blobs.push(descriptor.digest.clone());
            }
            layers.push(descriptor);
        }

        let manifest = UploadManifest::new(config.clone(), layers.clone());
        self.put_manifest(&base, truncate_image_id(image_id), &manifest).await?;
        reporter.finish();

        info!(
            service = beamo_id,
            layers = layers.len(),
            skipped = skipped_blobs.len(),
            "image uploaded"
        );
        Ok(UploadReport {
            beamo_id: beamo_id.to_string(),
            config,
            layers,
            skipped_blobs,
        })
    }

    pub async fn blob_exists(&self, base: &Url, digest: &str) -> Result<bool> {
        let url = base.join(&format!("blobs/{digest}"))?;
        let response = self.client.head(url).send().await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Uploads one blob unless the registry has it. Returns its descriptor and whether it
    /// was skipped.
    async fn upload_blob(
        &self,
        base: &Url,
        blob: &ArchiveBlob,
        media_type: &str,
        on_bytes: BytesSent,
    ) -> Result<(BlobDescriptor, bool)> {
        let digest = sha256_digest(&blob.data);
        let descriptor = BlobDescriptor {
            media_type: media_type.to_string(),
            size: blob.data.len() as u64,
            digest: digest.clone(),
        };

        if self.blob_exists(base, &digest).await? {
            debug!(digest = %digest, path = %blob.path, "blob already in registry");
            on_bytes(descriptor.size);
            return Ok((descriptor, true));
        }

        let location = self.start_upload(base, &digest).await?;
        match self.settings.chunk_size.filter(|&size| size > 0 && blob.data.len() > size) {
            Some(chunk_size) => {
                self.upload_chunked(base, location, &digest, &blob.data, chunk_size, on_bytes)
                    .await?
            }
            None => self.upload_whole(location, blob.data.clone(), on_bytes).await?,
        }
        debug!(digest = %digest, size = descriptor.size, "blob uploaded");
        Ok((descriptor, false))
    }

    async fn start_upload(&self, base: &Url, digest: &str) -> Result<Url> {
        let url = base.join("blobs/uploads/")?;
        let response = ensure_success(self.client.post(url).body("").send().await?).await?;
        let location = location_header(&response)?;
        normalize_upload_location(base, &location, digest, self.settings.force_https)
    }

    /// Streams the blob in one `PUT`. Chunks are slices of `data`, so the body shares its buffer.
    async fn upload_whole(&self, location: Url, data: Bytes, on_bytes: BytesSent) -> Result<()> {
        let len = data.len();
        let request = self
            .client
            .put(location)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len);

        // An empty range has no valid `Content-Range`.
        let request = if len == 0 {
            request.body(Body::from(Bytes::new()))
        } else {
            let chunks = (0..len)
                .step_by(STREAM_CHUNK)
                .map(move |start| data.slice(start..(start + STREAM_CHUNK).min(len)));
            let body = Body::wrap_stream(stream::iter(chunks.map(move |chunk| {
                on_bytes(chunk.len() as u64);
                Ok::<_, std::io::Error>(chunk)
            })));
            request
                .header(CONTENT_RANGE, format!("bytes 0-{}/{len}", len - 1))
                .body(body)
        };

        ensure_success(request.send().await?).await?;
        Ok(())
    }

    /// `PATCH` every chunk but the last, following the `Location` each response returns;
    /// the last chunk closes the upload with a `PUT`.
    async fn upload_chunked(
        &self,
        base: &Url,
        mut location: Url,
        digest: &str,
        data: &Bytes,
        chunk_size: usize,
        on_bytes: BytesSent,
    ) -> Result<()> {
        let chunk_count = data.len().div_ceil(chunk_size);
        for index in 0..chunk_count {
            let start = index * chunk_size;
            let chunk = data.slice(start..(start + chunk_size).min(data.len()));
            let chunk_len = chunk.len();
            let end = start + chunk_len - 1;
            let is_last = index + 1 == chunk_count;
            let request = if is_last {
                self.client.put(location.clone())
            } else {
                self.client.patch(location.clone())
            };
            let response = request
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, chunk_len)
                .header(CONTENT_RANGE, format!("{start}-{end}"))
                .body(chunk)
                .send()
                .await?;
            let response = ensure_success(response).await?;
            on_bytes(chunk_len as u64);

            if !is_last {
                let next = location_header(&response)?;
                location = normalize_upload_location(base, &next, digest, self.settings.force_https)?;
            }
        }
        Ok(())
    }

    async fn put_manifest(&self, base: &Url, reference: &str, manifest: &UploadManifest) -> Result<()> {
        let url = base.join(&format!("manifests/{reference}"))?;
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(serde_json::to_vec(manifest)?)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn location_header(response: &Response) -> Result<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| BeamoError::Registry {
            status: response.status().as_u16(),
            url: response.url().to_string(),
            body: "response has no Location header".into(),
        })
}
