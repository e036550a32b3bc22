//! Error types for the token layer.

use lrt_store::{QueryError, StoreError};
use thiserror::Error;

/// Result type alias for token operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Errors raised by tokens, token lists and the batch helpers.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{0} is not implemented for tokens without a store")]
    NotImplemented(&'static str),

    #[error("token with id {0} already exists; tokens need unique '_id' fields")]
    DuplicateId(String),

    #[error("appending token of wrong token type, {found} != {expected}")]
    WrongTokenType { found: String, expected: String },

    #[error("field {0} cannot be changed after creation")]
    ImmutableField(String),

    #[error("token list is already bound to database {0}")]
    DatabaseAlreadySet(String),

    #[error("token list has no database")]
    NoDatabase,

    #[error("token list has no token type")]
    NoTokenType,

    #[error("token type must not be empty")]
    EmptyTokenType,

    #[error("unsupported PiCaS API version {0}")]
    UnsupportedApiVersion(f64),

    #[error("invalid PiCaS API version {0}")]
    InvalidApiVersion(String),

    #[error("invalid token configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to write {id}: {error} ({reason})")]
    BulkWrite {
        id: String,
        error: String,
        reason: String,
    },

    #[error("invalid view condition: {0}")]
    Query(#[from] QueryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl TokenError {
    /// True when the underlying store reported a missing document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TokenError::Store(e) if e.is_not_found())
    }
}
