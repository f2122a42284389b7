//! Payload codecs.
//!
//! The vault treats payloads as opaque bytes except in three places: field
//! predicates need a decoded view, `patch` needs a field-level merge, and
//! `update`/`patch` may carry a new position inside the payload. A
//! [`PayloadCodec`] supplies all three.

use bytes::Bytes;
use pebble_query::FieldPath;
use pebble_spatial::Point3;
use serde_json::{Map, Value};
use thiserror::Error;

/// Codec error type.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload is not valid JSON.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Durable envelope could not be encoded or decoded.
    #[error("invalid record envelope: {0}")]
    Envelope(#[from] bincode::Error),

    /// Merge needs both sides to be objects.
    #[error("payload is not an object")]
    NotAnObject,

    /// The position field holds something other than three numbers.
    #[error("field `{0}` is not a position")]
    BadPosition(String),
}

/// How a payload wants the record position to change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionUpdate {
    /// Payload says nothing about position.
    Keep,
    /// Move to this position.
    Set(Point3),
    /// Payload explicitly clears the position.
    Clear,
}

impl PositionUpdate {
    /// Apply to the current position.
    #[must_use]
    pub fn apply(self, current: Option<Point3>) -> Option<Point3> {
        match self {
            Self::Keep => current,
            Self::Set(p) => Some(p),
            Self::Clear => None,
        }
    }
}

/// Interprets payload bytes.
pub trait PayloadCodec: Send + Sync {
    /// Decode a payload for predicate evaluation.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be decoded.
    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError>;

    /// Merge `patch` into `base`, last write wins per field.
    ///
    /// # Errors
    /// Returns an error if either side cannot be merged.
    fn merge(&self, base: &[u8], patch: &[u8]) -> Result<Bytes, CodecError>;

    /// Position carried by `payload`, if any.
    ///
    /// # Errors
    /// Returns an error if the payload carries a malformed position.
    fn position(&self, payload: &[u8]) -> Result<PositionUpdate, CodecError>;
}

/// JSON object payloads.
///
/// Merging replaces top-level fields. If `position_field` is set, a value of
/// `[x, y, z]` or `{"x": .., "y": .., "z": ..}` under that path moves the
/// record and `null` clears its position. Payloads that are not JSON are
/// stored untouched and never move the record.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    position_field: Option<FieldPath>,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonCodec {
    /// Field name used by [`JsonCodec::new`].
    pub const DEFAULT_POSITION_FIELD: &'static str = "position";

    /// Codec reading positions from the `position` field.
    #[must_use]
    pub fn new() -> Self {
        Self::with_position_field(Self::DEFAULT_POSITION_FIELD)
    }

    /// Codec reading positions from `field`.
    #[must_use]
    pub fn with_position_field(field: impl Into<FieldPath>) -> Self {
        Self {
            position_field: Some(field.into()),
        }
    }

    /// Codec that never derives positions from payloads.
    #[must_use]
    pub const fn without_position() -> Self {
        Self { position_field: None }
    }

    /// Configured position field.
    #[must_use]
    pub const fn position_field(&self) -> Option<&FieldPath> {
        self.position_field.as_ref()
    }
}

impl PayloadCodec for JsonCodec {
    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn merge(&self, base: &[u8], patch: &[u8]) -> Result<Bytes, CodecError> {
        let Value::Object(mut merged) = self.decode(base)? else {
            return Err(CodecError::NotAnObject);
        };
        let Value::Object(fields) = self.decode(patch)? else {
            return Err(CodecError::NotAnObject);
        };

        merged.extend(fields);
        Ok(Bytes::from(serde_json::to_vec(&Value::Object(merged))?))
    }

    fn position(&self, payload: &[u8]) -> Result<PositionUpdate, CodecError> {
        let Some(field) = &self.position_field else {
            return Ok(PositionUpdate::Keep);
        };
        let Ok(doc) = serde_json::from_slice::<Value>(payload) else {
            return Ok(PositionUpdate::Keep);
        };

        match field.resolve(&doc) {
            None => Ok(PositionUpdate::Keep),
            Some(Value::Null) => Ok(PositionUpdate::Clear),
            Some(value) => point_from_value(value)
                .map(PositionUpdate::Set)
                .ok_or_else(|| CodecError::BadPosition(field.to_string())),
        }
    }
}

fn point_from_value(value: &Value) -> Option<Point3> {
    match value {
        Value::Array(items) => match items.as_slice() {
            [x, y, z] => Some(Point3::new(x.as_f64()?, y.as_f64()?, z.as_f64()?)),
            _ => None,
        },
        Value::Object(map) => {
            let axis = |name: &str, map: &Map<String, Value>| map.get(name).and_then(Value::as_f64);
            Some(Point3::new(axis("x", map)?, axis("y", map)?, axis("z", map)?))
        }
        _ => None,
    }
}
