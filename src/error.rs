//! Error types
//!
//! One variant per failure kind the registry distinguishes. Lookup misses,
//! decode failures, transport and storage failures are all recoverable:
//! callers get them back as values, background loops log and continue.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for registry operations
#[derive(Error, Debug)]
pub enum Error {
    /// Service, node, certificate or type query found nothing
    #[error("not found")]
    NotFound,

    /// A payload could not be decoded (inbound message or stored value)
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Sending or connecting failed
    #[error("transport failure: {0}")]
    Transport(String),

    /// Durable store I/O failed
    #[error("storage failure: {0}")]
    Storage(String),

    /// Message type the registry does not know
    #[error("unsupported message type: {0}")]
    Unsupported(String),

    /// Socket or listener setup error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedPayload(e.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.to_string())
    }
}
