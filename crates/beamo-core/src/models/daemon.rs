use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::protocol::{BindMount, EnvironmentVariable, NamedVolume, PortBinding};

/// What the daemon reports about a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub container_id: String,
    /// Container name without the leading `/` the daemon puts in front of it.
    pub name: String,
    pub image_id: String,
    pub is_running: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub port_bindings: Vec<PortBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Create,
    Start,
    Stop,
    Destroy,
}

impl ContainerAction {
    /// Parse a daemon event action. Actions we do not track return `None`.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Create),
            "start" => Some(Self::Start),
            "stop" | "die" => Some(Self::Stop),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// A container lifecycle event from the daemon's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub action: ContainerAction,
}

impl ContainerEvent {
    pub fn new(container_id: impl Into<String>, action: ContainerAction) -> Self {
        Self {
            container_id: container_id.into(),
            action,
        }
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub health_cmd: Option<String>,
    pub auto_remove: bool,
    pub port_bindings: Vec<PortBinding>,
    pub volumes: Vec<NamedVolume>,
    pub bind_mounts: Vec<BindMount>,
    pub env: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Image tag. Daemons require lowercase tags.
    pub tag: String,
    pub context_path: String,
    pub dockerfile_path: String,
}

/// Progress callback for long-running daemon work. Values are in `[0, 1]`.
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);
