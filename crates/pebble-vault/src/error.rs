//! Vault error types.

use std::fmt;

use pebble_query::ParseError;
use pebble_spatial::Point3;
use thiserror::Error;

use crate::codec::CodecError;
use crate::sink::SinkError;

/// Vault error type.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No record with this key in the collection.
    #[error("record not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    /// No collection with this name.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// A record with this key already exists.
    #[error("duplicate key: {collection}/{key}")]
    DuplicateKey { collection: String, key: String },

    /// A collection with this name already exists.
    #[error("collection already exists: {0}")]
    AlreadyExists(String),

    /// A transaction observed state that changed before commit.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Eviction refused because the record has unpersisted changes.
    #[error("record not persisted: {collection}/{key}")]
    NotPersisted { collection: String, key: String },

    /// The durable sink failed or timed out.
    #[error("sink failure: {0}")]
    Failure(#[from] SinkError),

    /// The spatial index disagrees with the records even after a rebuild.
    #[error("spatial index corrupted in collection {0}")]
    IndexCorruption(String),

    /// A position with a NaN or infinite coordinate.
    #[error("invalid position: {0:?}")]
    InvalidPosition(Point3),

    /// Payload or envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Text predicate is malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl VaultError {
    pub(crate) fn not_found(collection: &str, key: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn duplicate(collection: &str, key: &str) -> Self {
        Self::DuplicateKey {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    /// Flat classification for callers across a host boundary.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::CollectionNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotPersisted { .. } => ErrorKind::NotPersisted,
            Self::Failure(_) => ErrorKind::Failure,
            Self::IndexCorruption(_) => ErrorKind::IndexCorruption,
            Self::InvalidPosition(_) => ErrorKind::InvalidPosition,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Parse(_) => ErrorKind::Parse,
        }
    }
}

/// Error classification without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    DuplicateKey,
    AlreadyExists,
    Conflict,
    NotPersisted,
    Failure,
    IndexCorruption,
    InvalidPosition,
    Codec,
    Parse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
