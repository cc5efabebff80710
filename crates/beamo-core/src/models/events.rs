/// Progress notifications from a deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployEvent {
    /// Build or pull progress for one service image, in `[0, 1]`.
    ImageProgress { beamo_id: String, progress: f32 },
    /// The service's container is up with its current image.
    ServiceDeployed { beamo_id: String },
}

/// Change observed through the daemon event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStateChange {
    Created { beamo_id: String, container_id: String },
    Started { beamo_id: String, container_id: String },
    Stopped { beamo_id: String, container_id: String },
    Removed { beamo_id: String, container_id: String },
    /// The daemon closed the event stream. Last message of a subscription that was not
    /// stopped by the caller; the runtime is no longer kept current.
    SubscriptionEnded,
}

impl ServiceStateChange {
    pub fn beamo_id(&self) -> Option<&str> {
        match self {
            Self::Created { beamo_id, .. }
            | Self::Started { beamo_id, .. }
            | Self::Stopped { beamo_id, .. }
            | Self::Removed { beamo_id, .. } => Some(beamo_id),
            Self::SubscriptionEnded => None,
        }
    }
}
