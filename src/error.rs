//! Error types for kwpm

use thiserror::Error;

/// Result type alias for kwpm operations
pub type Result<T> = std::result::Result<T, KwpmError>;

/// Errors that can occur while building, checking or applying site manifests
#[derive(Debug, Error)]
pub enum KwpmError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),
    /// Referenced secrets, config maps or claims are absent from the namespace
    #[error("Missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),
    /// Manifest breaks one of its invariants
    #[error("Invalid manifest: {}", .0.join("; "))]
    InvalidManifest(Vec<String>),
}

impl From<kube::Error> for KwpmError {
    fn from(err: kube::Error) -> Self {
        KwpmError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for KwpmError {
    fn from(err: serde_json::Error) -> Self {
        KwpmError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KwpmError {
    fn from(err: serde_yaml::Error) -> Self {
        KwpmError::Serialization(err.to_string())
    }
}
