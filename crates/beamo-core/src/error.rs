use std::path::PathBuf;

/// Classification of a container daemon failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonErrorKind {
    /// The referenced image does not exist (or was already deleted).
    NoSuchImage,
    /// The referenced container does not exist (or was already removed).
    NoSuchContainer,
    /// The daemon could not be reached.
    Unavailable,
    /// A name or resource is already in use.
    Conflict,
    /// Any other daemon failure.
    Failed,
}

impl DaemonErrorKind {
    /// Whether the failure only says the target is already gone.
    /// Teardown paths swallow these and propagate everything else.
    pub fn is_missing(self) -> bool {
        matches!(self, Self::NoSuchImage | Self::NoSuchContainer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BeamoError {
    #[error("invalid beamo id '{0}': only alphanumeric characters and underscores are allowed")]
    InvalidBeamoId(String),

    #[error("service '{0}' is already registered")]
    DuplicateBeamoId(String),

    #[error("service '{0}' not found")]
    UnknownService(String),

    #[error("service '{0}' has cyclical dependencies")]
    CyclicDependency(String),

    #[error("protocol data for '{0}' does not match its declared protocol")]
    ProtocolMismatch(String),

    #[error("service '{beamo_id}' cannot be built locally: {reason}")]
    NotBuildable { beamo_id: String, reason: String },

    #[error("docker daemon error ({kind:?}): {message}")]
    Daemon {
        kind: DaemonErrorKind,
        message: String,
    },

    #[error("registry request to {url} failed with status {status}: {body}")]
    Registry {
        status: u16,
        url: String,
        body: String,
    },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("image archive is invalid: {0}")]
    Archive(String),

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl BeamoError {
    pub fn daemon(kind: DaemonErrorKind, message: impl Into<String>) -> Self {
        Self::Daemon {
            kind,
            message: message.into(),
        }
    }

    /// The daemon error kind, if this is a daemon failure.
    pub fn daemon_kind(&self) -> Option<DaemonErrorKind> {
        match self {
            Self::Daemon { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BeamoError>;
