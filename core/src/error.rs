//! Error types for catalog synchronization and storage.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Durable store read/write failure. Crash recovery can no longer be
    /// trusted once one of these is seen.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A page request to the source failed.
    #[error("source fetch failed at offset {offset}: {message}")]
    SourceFetch { offset: u64, message: String },
}

impl From<sled::Error> for CatalogError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<bincode::Error> for CatalogError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Transient failure reported by a paginated source (network, HTTP status,
/// timeout or an undecodable body).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self(format!("request timed out: {e}"))
        } else {
            Self(e.to_string())
        }
    }
}
