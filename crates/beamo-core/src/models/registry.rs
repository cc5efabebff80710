use serde::{Deserialize, Serialize};

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// One entry of the `manifest.json` inside an image archive.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DockerArchiveManifest {
    /// Archive path of the image config file.
    pub config: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    /// Archive paths of the layer tarballs, base layer first.
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// Registry image manifest, schema 2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: BlobDescriptor,
    pub layers: Vec<BlobDescriptor>,
}

impl UploadManifest {
    pub fn new(config: BlobDescriptor, layers: Vec<BlobDescriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.into(),
            config,
            layers,
        }
    }
}

/// Outcome of pushing one service image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub beamo_id: String,
    pub config: BlobDescriptor,
    pub layers: Vec<BlobDescriptor>,
    /// Digests the registry already had.
    pub skipped_blobs: Vec<String>,
}
