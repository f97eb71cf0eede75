//! Error types for the sluice operator

use thiserror::Error;

/// Main error type for sluice operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Manifest source retrieval error
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Manifest parsing/decoding error
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Apply-engine failure for a specific resource
    #[error("apply error: {0}")]
    Apply(String),
}

impl Error {
    /// Create a fetch error with the given message
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create a manifest error with the given message
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an apply error with the given message
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }
}
