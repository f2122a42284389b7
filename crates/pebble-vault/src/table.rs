//! Keyed in-memory record storage for one collection.
//!
//! The table owns record versions and dirty flags and nothing else: it has
//! no idea whether its collection is spatially indexed. Callers mirror
//! position changes into the index while they still hold the table lock.
//!
//! Besides the public `version`, every stored record carries a private
//! *revision* drawn from a per-table counter. Revisions never repeat, even
//! when a key is removed and inserted again, so transactions use them to
//! detect concurrent writes.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use pebble_spatial::Point3;

use crate::error::{VaultError, VaultResult};
use crate::record::Record;

#[derive(Debug, Clone)]
struct Slot {
    record: Arc<Record>,
    revision: u64,
}

/// Records of one collection, keyed by record key.
#[derive(Debug)]
pub struct RecordTable {
    name: Arc<str>,
    records: HashMap<String, Slot>,
    next_revision: u64,
    positioned: usize,
    dropped: bool,
}

impl RecordTable {
    /// Create an empty table. `name` is only used in error values.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            records: HashMap::new(),
            next_revision: 1,
            positioned: 0,
            dropped: false,
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arc<Record>> {
        self.records.get(key).map(|slot| &slot.record)
    }

    /// Check if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Number of records carrying a position.
    #[must_use]
    pub fn positioned(&self) -> usize {
        self.positioned
    }

    /// Number of records with unpersisted changes.
    #[must_use]
    pub fn dirty(&self) -> usize {
        self.records.values().filter(|slot| slot.record.dirty).count()
    }

    /// Iterate over all records in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Record>> {
        self.records.values().map(|slot| &slot.record)
    }

    /// All `(key, position)` pairs of positioned records.
    pub fn positions(&self) -> impl Iterator<Item = (&str, Point3)> {
        self.records
            .iter()
            .filter_map(|(key, slot)| slot.record.position.map(|p| (key.as_str(), p)))
    }

    /// All records sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Record>> {
        let mut records: Vec<_> = self.iter().cloned().collect();
        records.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Insert a new record at version 1.
    ///
    /// # Errors
    /// Returns `DuplicateKey` if `key` is present.
    pub fn insert(
        &mut self,
        key: String,
        payload: Bytes,
        position: Option<Point3>,
    ) -> VaultResult<Arc<Record>> {
        if self.records.contains_key(&key) {
            return Err(VaultError::duplicate(&self.name, &key));
        }
        Ok(self.store(Record::fresh(key, payload, position)))
    }

    /// Replace payload and position of an existing record.
    ///
    /// # Errors
    /// Returns `NotFound` if `key` is absent.
    pub fn update(
        &mut self,
        key: &str,
        payload: Bytes,
        position: Option<Point3>,
    ) -> VaultResult<Arc<Record>> {
        let next = self
            .get(key)
            .ok_or_else(|| VaultError::not_found(&self.name, key))?
            .next(payload, position);
        Ok(self.store(next))
    }

    /// Remove a record, returning it with its version bumped.
    ///
    /// # Errors
    /// Returns `NotFound` if `key` is absent.
    pub fn remove(&mut self, key: &str) -> VaultResult<Record> {
        let removed = self
            .take(key)
            .ok_or_else(|| VaultError::not_found(&self.name, key))?;
        Ok(removed.next(removed.payload.clone(), removed.position))
    }

    /// Store `record` as is, replacing any record with the same key.
    pub fn store(&mut self, record: Record) -> Arc<Record> {
        let revision = self.next_revision;
        self.next_revision += 1;

        if record.position.is_some() {
            self.positioned += 1;
        }

        let record = Arc::new(record);
        let slot = Slot {
            record: Arc::clone(&record),
            revision,
        };
        if let Some(old) = self.records.insert(record.key.clone(), slot) {
            if old.record.position.is_some() {
                self.positioned -= 1;
            }
        }
        record
    }

    /// Drop a record without treating it as a mutation.
    pub fn take(&mut self, key: &str) -> Option<Arc<Record>> {
        let slot = self.records.remove(key)?;
        if slot.record.position.is_some() {
            self.positioned -= 1;
        }
        Some(slot.record)
    }

    /// Clear the dirty flag, but only if the record is still at `revision`.
    pub fn mark_clean(&mut self, key: &str, revision: u64) -> bool {
        match self.records.get_mut(key) {
            Some(slot) if slot.revision == revision => {
                if slot.record.dirty {
                    let mut record = (*slot.record).clone();
                    record.dirty = false;
                    slot.record = Arc::new(record);
                }
                true
            }
            _ => false,
        }
    }

    /// Set the dirty flag. Returns `false` if `key` is absent.
    pub fn mark_dirty(&mut self, key: &str) -> bool {
        let Some(slot) = self.records.get_mut(key) else {
            return false;
        };
        if !slot.record.dirty {
            let mut record = (*slot.record).clone();
            record.dirty = true;
            slot.record = Arc::new(record);
        }
        true
    }

    /// Remove every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.positioned = 0;
    }

    /// Current revision of `key`, `None` if absent.
    pub(crate) fn revision(&self, key: &str) -> Option<u64> {
        self.records.get(key).map(|slot| slot.revision)
    }

    /// Record and revision of `key`.
    pub(crate) fn get_with_revision(&self, key: &str) -> Option<(Arc<Record>, u64)> {
        self.records
            .get(key)
            .map(|slot| (Arc::clone(&slot.record), slot.revision))
    }

    pub(crate) fn mark_dropped(&mut self) {
        self.dropped = true;
        self.clear();
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped
    }
}
