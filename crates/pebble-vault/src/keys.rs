//! Key encoding for the durable sink.
//!
//! Every record maps to one sink key. The collection name is length-prefixed
//! so that no pair of `(collection, key)` strings can collide, whatever
//! characters they contain:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  "5:fleet/ship-1"                                    │
//! ├──────────────────────────────────────────────────────┤
//! │  len(collection) in decimal  ":"                     │
//! │  collection                  "/"                     │
//! │  record key (rest of the string)                     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! All keys of one collection share the prefix returned by
//! [`SinkKey::collection_prefix`].

use std::fmt;

/// A `(collection, key)` pair addressing one record in the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkKey<'a> {
    collection: &'a str,
    key: &'a str,
}

impl<'a> SinkKey<'a> {
    /// Create a new sink key.
    #[inline]
    #[must_use]
    pub const fn new(collection: &'a str, key: &'a str) -> Self {
        Self { collection, key }
    }

    /// Collection part.
    #[inline]
    #[must_use]
    pub const fn collection(&self) -> &'a str {
        self.collection
    }

    /// Record key part.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> &'a str {
        self.key
    }

    /// Encode for storage.
    #[must_use]
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decode an encoded key. Returns `None` if the length prefix is
    /// missing, malformed or out of range.
    #[must_use]
    pub fn decode(raw: &'a str) -> Option<Self> {
        let (len, rest) = raw.split_once(':')?;
        if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let len: usize = len.parse().ok()?;
        let collection = rest.get(..len)?;
        let key = rest.get(len..)?.strip_prefix('/')?;
        Some(Self { collection, key })
    }

    /// Prefix shared by every key of `collection`.
    #[must_use]
    pub fn collection_prefix(collection: &str) -> String {
        format!("{}:{collection}/", collection.len())
    }
}

impl fmt::Display for SinkKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.collection.len(), self.collection, self.key)
    }
}
