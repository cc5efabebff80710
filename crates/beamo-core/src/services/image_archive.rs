use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;

use crate::error::{BeamoError, Result};
use crate::models::DockerArchiveManifest;

const ARCHIVE_MANIFEST: &str = "manifest.json";

/// A file pulled out of an image archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBlob {
    pub path: String,
    pub data: Bytes,
}

/// Config and layers of an `image save` archive, in manifest order.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    pub config: ArchiveBlob,
    pub layers: Vec<ArchiveBlob>,
}

impl ImageArchive {
    pub fn total_layer_bytes(&self) -> u64 {
        self.layers.iter().map(|l| l.data.len() as u64).sum()
    }
}

pub fn read_image_archive(bytes: &[u8]) -> Result<ImageArchive> {
    let mut files: HashMap<String, Bytes> = HashMap::new();
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(path, Bytes::from(data));
    }

    let manifest_bytes = files
        .get(ARCHIVE_MANIFEST)
        .ok_or_else(|| BeamoError::Archive(format!("missing {ARCHIVE_MANIFEST}")))?;
    let manifests: Vec<DockerArchiveManifest> = serde_json::from_slice(manifest_bytes)
        .map_err(|e| BeamoError::Archive(format!("bad {ARCHIVE_MANIFEST}: {e}")))?;
    let manifest = manifests
        .into_iter()
        .next()
        .ok_or_else(|| BeamoError::Archive(format!("{ARCHIVE_MANIFEST} lists no images")))?;

    let blob = |path: &str| -> Result<ArchiveBlob> {
        let data = files
            .get(path)
            .ok_or_else(|| BeamoError::Archive(format!("archive has no entry {path}")))?;
        Ok(ArchiveBlob {
            path: path.to_string(),
            data: data.clone(),
        })
    };

    Ok(ImageArchive {
        config: blob(&manifest.config)?,
        layers: manifest
            .layers
            .iter()
            .map(|l| blob(l))
            .collect::<Result<_>>()?,
    })
}
