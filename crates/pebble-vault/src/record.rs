//! Records and their durable envelope.

use bytes::Bytes;
use pebble_spatial::Point3;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Unique within its collection.
    pub key: String,
    /// Caller-defined bytes.
    pub payload: Bytes,
    /// Optional position in the collection's space.
    pub position: Option<Point3>,
    /// Starts at 1, bumped on every mutation.
    pub version: u64,
    /// In-memory state differs from the last persisted state.
    pub dirty: bool,
}

impl Record {
    pub(crate) fn fresh(key: String, payload: Bytes, position: Option<Point3>) -> Self {
        Self {
            key,
            payload,
            position,
            version: 1,
            dirty: true,
        }
    }

    /// The record after one more mutation.
    pub(crate) fn next(&self, payload: Bytes, position: Option<Point3>) -> Self {
        Self {
            key: self.key.clone(),
            payload,
            position,
            version: self.version + 1,
            dirty: true,
        }
    }

    /// Encode the persistent part of the record.
    ///
    /// # Errors
    /// Returns `CodecError::Envelope` if bincode fails.
    pub fn to_envelope(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = Envelope {
            payload: self.payload.to_vec(),
            position: self.position,
            version: self.version,
        };
        Ok(bincode::serialize(&envelope)?)
    }

    /// Decode a record stored under `key`. The result is clean.
    ///
    /// # Errors
    /// Returns `CodecError::Envelope` if the bytes are not a valid envelope.
    pub fn from_envelope(key: &str, bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        Ok(Self {
            key: key.to_string(),
            payload: Bytes::from(envelope.payload),
            position: envelope.position,
            version: envelope.version,
            dirty: false,
        })
    }
}

/// What the sink holds for one record.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: Vec<u8>,
    position: Option<Point3>,
    version: u64,
}

/// Input item for bulk insertion.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub key: String,
    pub payload: Bytes,
    pub position: Option<Point3>,
}

impl NewRecord {
    /// A record without a position.
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            position: None,
        }
    }

    /// Attach a position.
    #[must_use]
    pub fn at(mut self, position: impl Into<Point3>) -> Self {
        self.position = Some(position.into());
        self
    }
}
