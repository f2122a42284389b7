//! Lazy predicate queries over a collection.
//!
//! A [`Query`] is a recipe, not a cursor. Every call to [`Query::iter`]
//! takes a fresh snapshot of the collection's records (cheap `Arc` clones,
//! sorted by key) and evaluates the predicate one record at a time as the
//! iterator is advanced.
//!
//! When the predicate requires a `within` sphere at its top level and the
//! collection is indexed, the index narrows the snapshot to the candidate
//! keys. Every other predicate scans the whole collection.

use std::sync::Arc;

use pebble_query::{FieldPath, Predicate, Subject};
use pebble_spatial::Point3;
use serde_json::Value;
use tracing::trace;

use crate::codec::PayloadCodec;
use crate::error::VaultResult;
use crate::record::Record;
use crate::vault::Vault;

/// A restartable query over one collection.
#[derive(Debug)]
pub struct Query<'v> {
    vault: &'v Vault,
    collection: String,
    predicate: Predicate,
}

impl<'v> Query<'v> {
    pub(crate) fn new(vault: &'v Vault, collection: &str, predicate: Predicate) -> Self {
        Self {
            vault,
            collection: collection.to_string(),
            predicate,
        }
    }

    /// The predicate being evaluated.
    #[must_use]
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Start a fresh pass over the collection.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if the collection was dropped, or
    /// `IndexCorruption` if a spatial pre-filter could not be repaired.
    pub fn iter(&self) -> VaultResult<QueryIter<'_>> {
        let collection = self.vault.collection(&self.collection)?;

        let records = match self.predicate.spatial_hint() {
            Some((origin, radius)) if collection.is_indexed() => {
                collection.within_records(&origin, radius, self.vault.config().verify_spatial_lookups)?
            }
            _ => collection.read()?.snapshot(),
        };

        trace!(
            collection = self.collection,
            candidates = records.len(),
            "query pass"
        );

        Ok(QueryIter {
            records: records.into_iter(),
            predicate: &self.predicate,
            codec: self.vault.codec(),
        })
    }

    /// Collect one pass.
    ///
    /// # Errors
    /// See [`Query::iter`].
    pub fn records(&self) -> VaultResult<Vec<Record>> {
        Ok(self.iter()?.collect())
    }

    /// Keys of one pass, sorted.
    ///
    /// # Errors
    /// See [`Query::iter`].
    pub fn keys(&self) -> VaultResult<Vec<String>> {
        Ok(self.iter()?.map(|r| r.key).collect())
    }

    /// Number of matches in one pass.
    ///
    /// # Errors
    /// See [`Query::iter`].
    pub fn count(&self) -> VaultResult<usize> {
        Ok(self.iter()?.count())
    }
}

/// One pass of a [`Query`].
pub struct QueryIter<'q> {
    records: std::vec::IntoIter<Arc<Record>>,
    predicate: &'q Predicate,
    codec: &'q dyn PayloadCodec,
}

impl Iterator for QueryIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let needs_payload = self.predicate.needs_payload();

        self.records.find_map(|record| {
            let payload = if needs_payload {
                match self.codec.decode(&record.payload) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        trace!(key = record.key, error = %e, "payload not decodable, skipping");
                        return None;
                    }
                }
            } else {
                None
            };

            let candidate = Candidate {
                payload,
                position: record.position,
            };
            self.predicate
                .matches(&candidate)
                .then(|| Record::clone(&record))
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.records.len()))
    }
}

struct Candidate {
    payload: Option<Value>,
    position: Option<Point3>,
}

impl Subject for Candidate {
    fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.payload.as_ref().and_then(|payload| path.resolve(payload))
    }

    fn position(&self) -> Option<Point3> {
        self.position
    }
}
