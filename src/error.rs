//! Error types for Kubeship

use thiserror::Error;

/// Main error type for Kubeship operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A required input was missing or malformed (training files, tag, dockerfile)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Artifact download or extraction error
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Image build, push or registry authentication error
    #[error("image error: {0}")]
    Image(String),

    /// A resource read failed with something other than not-found
    #[error("cluster read failed for {kind} {name}: {message}")]
    Cluster {
        /// Resource kind (e.g., "Deployment")
        kind: String,
        /// Resource name
        name: String,
        /// Underlying failure
        message: String,
    },

    /// Callback delivery error
    #[error("callback error: {0}")]
    Callback(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Startup configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create an artifact error with the given message
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create an image error with the given message
    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    /// Create a cluster read error for a specific resource
    pub fn cluster(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cluster {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a callback error with the given message
    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
