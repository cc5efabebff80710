use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::protocol::{LocalProtocol, ProtocolType, RemoteProtocol};

/// Drops the `sha256:` prefix and keeps the first 12 hex characters. Ids without an
/// algorithm prefix are returned unchanged.
pub fn truncate_image_id(image_id: &str) -> &str {
    match image_id.split_once(':') {
        Some((_, hash)) => hash.get(..12).unwrap_or(hash),
        None => image_id,
    }
}

/// Desired-state record for a single service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub beamo_id: String,
    pub protocol: ProtocolType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_directory: Option<String>,
    /// Last known built or pulled image. May be stale until the next sync.
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub depends_on_beamo_ids: Vec<String>,
    #[serde(default = "default_enabled")]
    pub should_be_enabled_on_remote: bool,
    #[serde(default)]
    pub service_group_tags: Vec<String>,
    #[serde(default)]
    pub is_in_remote: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServiceDefinition {
    pub fn new(beamo_id: impl Into<String>, protocol: ProtocolType) -> Self {
        Self {
            beamo_id: beamo_id.into(),
            protocol,
            project_directory: None,
            image_id: String::new(),
            depends_on_beamo_ids: Vec::new(),
            should_be_enabled_on_remote: true,
            service_group_tags: Vec::new(),
            is_in_remote: false,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_beamo_ids = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Image id shortened to the 12 hex characters the remote deploy expects.
    pub fn truncated_image_id(&self) -> &str {
        truncate_image_id(&self.image_id)
    }

    pub fn container_name(&self) -> String {
        self.protocol.container_name(&self.beamo_id)
    }
}

/// Desired-state aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub service_definitions: Vec<ServiceDefinition>,
    #[serde(default)]
    pub local_protocols: BTreeMap<String, LocalProtocol>,
    #[serde(default)]
    pub remote_protocols: BTreeMap<String, RemoteProtocol>,
    /// Group tag to every beamo id in the group, storage dependencies included.
    #[serde(default)]
    pub service_group_to_beamo_ids: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    pub fn definition(&self, beamo_id: &str) -> Option<&ServiceDefinition> {
        self.service_definitions
            .iter()
            .find(|sd| sd.beamo_id == beamo_id)
    }

    pub fn definition_mut(&mut self, beamo_id: &str) -> Option<&mut ServiceDefinition> {
        self.service_definitions
            .iter_mut()
            .find(|sd| sd.beamo_id == beamo_id)
    }

    pub fn local_protocol(&self, beamo_id: &str) -> Option<&LocalProtocol> {
        self.local_protocols.get(beamo_id)
    }

    pub fn remote_protocol(&self, beamo_id: &str) -> Option<&RemoteProtocol> {
        self.remote_protocols.get(beamo_id)
    }

    pub fn contains(&self, beamo_id: &str) -> bool {
        self.definition(beamo_id).is_some()
    }

    pub fn beamo_ids(&self) -> Vec<String> {
        self.service_definitions
            .iter()
            .map(|sd| sd.beamo_id.clone())
            .collect()
    }
}
