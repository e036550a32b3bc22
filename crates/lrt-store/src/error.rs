//! Error types for document store access.

use thiserror::Error;

/// Result type alias for document store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("document update conflict: {0}")]
    Conflict(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("view {0} cannot be evaluated by this store")]
    UnsupportedView(String),

    #[error("HTTP {status}: {error} ({reason})")]
    Http {
        status: u16,
        error: String,
        reason: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// True for the store's "document or attachment does not exist" failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
            || matches!(self, StoreError::Http { status: 404, .. })
    }
}
