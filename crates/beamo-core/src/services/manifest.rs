use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BeamoError, Result};
use crate::models::{
    BuildRequest, LocalProtocol, Manifest, RemoteProtocol, ServiceDefinition,
};
use crate::services::dependency::validate_no_cyclical_dependencies;

static BEAMO_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

pub fn validate_beamo_id(beamo_id: &str) -> Result<()> {
    if BEAMO_ID_RE.is_match(beamo_id) {
        Ok(())
    } else {
        Err(BeamoError::InvalidBeamoId(beamo_id.to_string()))
    }
}

/// Maps each group tag to the ids in that group. An HTTP service pulls its storage
/// dependencies into every group it belongs to.
pub fn resolve_service_groups(
    definitions: &[ServiceDefinition],
    local_protocols: &BTreeMap<String, LocalProtocol>,
) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for definition in definitions {
        for tag in &definition.service_group_tags {
            let members = groups.entry(tag.clone()).or_default();
            members.insert(definition.beamo_id.clone());
            if let Some(LocalProtocol::HttpMicroservice(local)) =
                local_protocols.get(&definition.beamo_id)
            {
                members.extend(local.storage_dependency_beamo_ids.iter().cloned());
            }
        }
    }
    groups
        .into_iter()
        .map(|(tag, ids)| (tag, ids.into_iter().collect()))
        .collect()
}

impl Manifest {
    /// Registers a new service along with its protocol payloads.
    pub fn add_definition(
        &mut self,
        definition: ServiceDefinition,
        local: LocalProtocol,
        remote: RemoteProtocol,
    ) -> Result<()> {
        let beamo_id = definition.beamo_id.clone();
        validate_beamo_id(&beamo_id)?;
        if self.contains(&beamo_id) {
            return Err(BeamoError::DuplicateBeamoId(beamo_id));
        }
        if local.protocol_type() != definition.protocol || remote.protocol_type() != definition.protocol {
            return Err(BeamoError::ProtocolMismatch(beamo_id));
        }

        self.service_definitions.push(definition);
        if !validate_no_cyclical_dependencies(&beamo_id, &self.service_definitions) {
            self.service_definitions.pop();
            return Err(BeamoError::CyclicDependency(beamo_id));
        }

        self.local_protocols.insert(beamo_id.clone(), local);
        self.remote_protocols.insert(beamo_id, remote);
        self.refresh_service_groups();
        Ok(())
    }

    pub fn refresh_service_groups(&mut self) {
        self.service_group_to_beamo_ids =
            resolve_service_groups(&self.service_definitions, &self.local_protocols);
    }

    /// Checks ids, uniqueness and that every protocol payload matches its definition.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for definition in &self.service_definitions {
            validate_beamo_id(&definition.beamo_id)?;
            if !seen.insert(definition.beamo_id.as_str()) {
                return Err(BeamoError::DuplicateBeamoId(definition.beamo_id.clone()));
            }
            let local_matches = self
                .local_protocol(&definition.beamo_id)
                .is_none_or(|p| p.protocol_type() == definition.protocol);
            let remote_matches = self
                .remote_protocol(&definition.beamo_id)
                .is_none_or(|p| p.protocol_type() == definition.protocol);
            if !local_matches || !remote_matches {
                return Err(BeamoError::ProtocolMismatch(definition.beamo_id.clone()));
            }
        }
        Ok(())
    }

    /// Whether the service can produce its image on this machine: an HTTP service needs a
    /// build context and Dockerfile, a storage needs a base image to pull.
    pub fn can_be_built_locally(&self, beamo_id: &str) -> Result<bool> {
        if !self.contains(beamo_id) {
            return Err(BeamoError::UnknownService(beamo_id.to_string()));
        }
        match self.local_protocol(beamo_id) {
            Some(LocalProtocol::HttpMicroservice(local)) => {
                let (Some(context), Some(dockerfile)) = (
                    local.docker_build_context_path.as_deref().filter(|p| !p.is_empty()),
                    local.relative_dockerfile_path.as_deref().filter(|p| !p.is_empty()),
                ) else {
                    return Ok(false);
                };
                if !Path::new(context).is_dir() {
                    return Err(BeamoError::NotBuildable {
                        beamo_id: beamo_id.to_string(),
                        reason: format!("build context does not exist: {context}"),
                    });
                }
                let dockerfile_path = Path::new(context).join(dockerfile);
                if !dockerfile_path.is_file() {
                    return Err(BeamoError::NotBuildable {
                        beamo_id: beamo_id.to_string(),
                        reason: format!("no Dockerfile at {}", dockerfile_path.display()),
                    });
                }
                Ok(true)
            }
            Some(LocalProtocol::EmbeddedMongoDb(local)) => Ok(!local.base_image.is_empty()),
            None => Ok(false),
        }
    }

    /// Reference to inspect for the service's current image: its own tag for HTTP services,
    /// the configured base image for storages.
    pub fn image_reference(&self, beamo_id: &str) -> Option<String> {
        match self.local_protocol(beamo_id)? {
            LocalProtocol::HttpMicroservice(_) => Some(beamo_id.to_lowercase()),
            LocalProtocol::EmbeddedMongoDb(local) => Some(local.base_image.clone()),
        }
    }

    pub fn build_request(&self, beamo_id: &str) -> Result<BuildRequest> {
        let Some(LocalProtocol::HttpMicroservice(local)) = self.local_protocol(beamo_id) else {
            return Err(BeamoError::ProtocolMismatch(beamo_id.to_string()));
        };
        let not_buildable = |reason: &str| BeamoError::NotBuildable {
            beamo_id: beamo_id.to_string(),
            reason: reason.to_string(),
        };
        let context = local
            .docker_build_context_path
            .as_deref()
            .ok_or_else(|| not_buildable("no build context"))?;
        let dockerfile = local
            .relative_dockerfile_path
            .as_deref()
            .ok_or_else(|| not_buildable("no Dockerfile path"))?;
        Ok(BuildRequest {
            tag: beamo_id.to_lowercase(),
            context_path: context.to_string(),
            dockerfile_path: Path::new(context).join(dockerfile).to_string_lossy().into_owned(),
        })
    }
}
