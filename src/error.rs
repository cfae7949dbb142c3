//! Error types for rollout

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for rollout operations
pub type Result<T> = std::result::Result<T, RolloutError>;

/// rollout error types
#[derive(Error, Debug)]
pub enum RolloutError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Build failed for {service}: {message}")]
    Build { service: String, message: String },

    #[error("Publish failed for {image}: {message}")]
    Publish { image: String, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Remote command `{command}` exited with {code}: {stderr}")]
    RemoteCommand {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Deployment lock error: {0}")]
    Lock(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classes a pipeline run can end with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    Build,
    Publish,
    Connection,
    RemoteCommand,
    Verification,
    Lock,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Authentication => write!(f, "authentication"),
            FailureKind::Build => write!(f, "build"),
            FailureKind::Publish => write!(f, "publish"),
            FailureKind::Connection => write!(f, "connection"),
            FailureKind::RemoteCommand => write!(f, "remote command"),
            FailureKind::Verification => write!(f, "verification"),
            FailureKind::Lock => write!(f, "lock"),
            FailureKind::Other => write!(f, "other"),
        }
    }
}

impl RolloutError {
    /// Classify this error for the run outcome
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RolloutError::Authentication(_) => FailureKind::Authentication,
            RolloutError::Build { .. } => FailureKind::Build,
            RolloutError::Publish { .. } => FailureKind::Publish,
            RolloutError::Connection(_) => FailureKind::Connection,
            RolloutError::RemoteCommand { .. } => FailureKind::RemoteCommand,
            RolloutError::Verification(_) => FailureKind::Verification,
            RolloutError::Lock(_) => FailureKind::Lock,
            _ => FailureKind::Other,
        }
    }
}

impl From<serde_yaml::Error> for RolloutError {
    fn from(e: serde_yaml::Error) -> Self {
        RolloutError::Yaml(e.to_string())
    }
}
