//! The vault handle.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use pebble_query::{Predicate, parse_predicate};
use pebble_spatial::{Aabb, Neighbor, Point3};
use tracing::{debug, info, trace, warn};

use crate::codec::{JsonCodec, PayloadCodec, PositionUpdate};
use crate::collection::{Collection, CollectionStats, sync_entry};
use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::keys::SinkKey;
use crate::query::Query;
use crate::record::{NewRecord, Record};
use crate::sink::{DurableSink, MemorySink, SinkError};
use crate::txn::Transaction;

pub(crate) type Registry = HashMap<Arc<str>, Arc<Collection>>;

/// Outcome of [`Vault::persist_all`].
#[derive(Debug, Default)]
pub struct PersistReport {
    /// Keys written to the sink, sorted.
    pub persisted: Vec<String>,
    /// Keys whose write failed, with the error.
    pub failed: Vec<(String, VaultError)>,
}

impl PersistReport {
    /// Check if every dirty record was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An in-memory record store with named collections, spatial lookups,
/// optimistic transactions and explicit persistence.
///
/// Vaults are independent: each owns its collections, codec and sink.
pub struct Vault {
    collections: RwLock<Registry>,
    codec: Arc<dyn PayloadCodec>,
    sink: Arc<dyn DurableSink>,
    config: VaultConfig,
    next_txn: AtomicU64,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("collections", &self.collection_names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Vault`].
#[derive(Default)]
pub struct VaultBuilder {
    codec: Option<Arc<dyn PayloadCodec>>,
    sink: Option<Arc<dyn DurableSink>>,
    config: VaultConfig,
}

impl VaultBuilder {
    /// Payload codec. Defaults to [`JsonCodec::new`].
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Durable sink. Defaults to a fresh [`MemorySink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn DurableSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Tunables.
    #[must_use]
    pub fn config(mut self, config: VaultConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the vault.
    #[must_use]
    pub fn build(self) -> Vault {
        Vault {
            collections: RwLock::new(HashMap::new()),
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec::new())),
            sink: self.sink.unwrap_or_else(|| Arc::new(MemorySink::new())),
            config: self.config,
            next_txn: AtomicU64::new(1),
        }
    }
}

impl Vault {
    /// Vault with a JSON codec, an in-memory sink and default config.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a vault.
    #[must_use]
    pub fn builder() -> VaultBuilder {
        VaultBuilder::default()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Payload codec.
    #[must_use]
    pub fn codec(&self) -> &dyn PayloadCodec {
        &*self.codec
    }

    /// Durable sink.
    #[must_use]
    pub fn sink(&self) -> &dyn DurableSink {
        &*self.sink
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.collections.read()
    }

    pub(crate) fn collection(&self, name: &str) -> VaultResult<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::CollectionNotFound(name.to_string()))
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    // ---- collections ----

    /// Create an empty collection, optionally with a spatial index.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the name is taken.
    pub fn create_collection(&self, name: &str, indexed: bool) -> VaultResult<()> {
        let mut registry = self.collections.write();
        if registry.contains_key(name) {
            return Err(VaultError::AlreadyExists(name.to_string()));
        }

        let shared: Arc<str> = Arc::from(name);
        let collection = Collection::new(Arc::clone(&shared), indexed, &self.config);
        registry.insert(shared, Arc::new(collection));

        info!(collection = name, indexed, "created collection");
        Ok(())
    }

    /// Drop a collection with all its records and index entries.
    ///
    /// The collection leaves the registry in one step; operations racing
    /// with the drop fail with `CollectionNotFound`.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn drop_collection(&self, name: &str) -> VaultResult<()> {
        let removed = self
            .collections
            .write()
            .remove(name)
            .ok_or_else(|| VaultError::CollectionNotFound(name.to_string()))?;

        removed.clear();
        info!(collection = name, "dropped collection");
        Ok(())
    }

    /// Names of all collections, sorted.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().map(|n| n.to_string()).collect();
        names.sort_unstable();
        names
    }

    /// Check if a collection exists.
    #[must_use]
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Record counts of a collection.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn stats(&self, collection: &str) -> VaultResult<CollectionStats> {
        self.collection(collection)?.stats()
    }

    /// Rebuild a collection's spatial index from its records.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn rebuild_index(&self, collection: &str) -> VaultResult<()> {
        self.collection(collection)?.rebuild_index()
    }

    // ---- records ----

    /// Insert a record at version 1.
    ///
    /// Without an explicit `position` the codec may supply one from the
    /// payload.
    ///
    /// # Errors
    /// Returns `DuplicateKey` if the key exists, `InvalidPosition` for
    /// non-finite coordinates.
    pub fn insert(
        &self,
        collection: &str,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
        position: Option<Point3>,
    ) -> VaultResult<u64> {
        let collection = self.collection(collection)?;
        self.insert_into(&collection, key.into(), payload.into(), position)
    }

    fn insert_into(
        &self,
        collection: &Collection,
        key: String,
        payload: Bytes,
        position: Option<Point3>,
    ) -> VaultResult<u64> {
        let position = match position {
            Some(p) => Some(p),
            None => self.codec.position(&payload)?.apply(None),
        };
        check_position(position)?;

        let version = collection.mutate(&key, |table| {
            table
                .insert(key.clone(), payload, position)
                .map(|r| r.version)
        })?;
        trace!(collection = collection.name(), key, "inserted");
        Ok(version)
    }

    /// Insert many records independently. Results are positional; a failed
    /// item does not affect the others.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn bulk_insert(
        &self,
        collection: &str,
        records: impl IntoIterator<Item = NewRecord>,
    ) -> VaultResult<Vec<VaultResult<u64>>> {
        let collection = self.collection(collection)?;
        Ok(records
            .into_iter()
            .map(|r| self.insert_into(&collection, r.key, r.payload, r.position))
            .collect())
    }

    /// Current state of a record.
    ///
    /// # Errors
    /// Returns `NotFound` if absent.
    pub fn read(&self, collection: &str, key: &str) -> VaultResult<Record> {
        let collection = self.collection(collection)?;
        let table = collection.read()?;
        table
            .get(key)
            .map(|r| Record::clone(r))
            .ok_or_else(|| VaultError::not_found(collection.name(), key))
    }

    /// Replace a record's payload. A position inside the payload moves the
    /// record; otherwise the position is kept.
    ///
    /// # Errors
    /// Returns `NotFound` if absent.
    pub fn update(&self, collection: &str, key: &str, payload: impl Into<Bytes>) -> VaultResult<u64> {
        let payload = payload.into();
        let moved = self.position_update(&payload)?;

        let collection = self.collection(collection)?;
        let version = collection.mutate(key, |table| {
            let current = table.get(key).and_then(|r| r.position);
            table.update(key, payload, moved.apply(current)).map(|r| r.version)
        })?;
        trace!(collection = collection.name(), key, version, "updated");
        Ok(version)
    }

    /// Merge `partial` into a record's payload through the codec. Only a
    /// position inside `partial` moves the record.
    ///
    /// # Errors
    /// Returns `NotFound` if absent, `Codec` if the payloads cannot merge.
    pub fn patch(&self, collection: &str, key: &str, partial: impl Into<Bytes>) -> VaultResult<u64> {
        let partial = partial.into();
        let moved = self.position_update(&partial)?;

        let collection = self.collection(collection)?;
        let version = collection.mutate(key, |table| {
            let base = Arc::clone(
                table
                    .get(key)
                    .ok_or_else(|| VaultError::not_found(table.name(), key))?,
            );
            let merged = self.codec.merge(&base.payload, &partial)?;
            table
                .update(key, merged, moved.apply(base.position))
                .map(|r| r.version)
        })?;
        trace!(collection = collection.name(), key, version, "patched");
        Ok(version)
    }

    /// Set or clear a record's position without touching its payload.
    ///
    /// # Errors
    /// Returns `NotFound` if absent, `InvalidPosition` for non-finite coordinates.
    pub fn relocate(&self, collection: &str, key: &str, position: Option<Point3>) -> VaultResult<u64> {
        check_position(position)?;

        let collection = self.collection(collection)?;
        let version = collection.mutate(key, |table| {
            let payload = table
                .get(key)
                .ok_or_else(|| VaultError::not_found(table.name(), key))?
                .payload
                .clone();
            table.update(key, payload, position).map(|r| r.version)
        })?;
        trace!(collection = collection.name(), key, version, "relocated");
        Ok(version)
    }

    /// Remove a record, returning it with its final version.
    ///
    /// # Errors
    /// Returns `NotFound` if absent.
    pub fn remove(&self, collection: &str, key: &str) -> VaultResult<Record> {
        let collection = self.collection(collection)?;
        let removed = collection.mutate(key, |table| table.remove(key))?;
        trace!(collection = collection.name(), key, "removed");
        Ok(removed)
    }

    /// Move a record to another collection. The record keeps its key and
    /// gets one more version.
    ///
    /// Moving within one collection is a no-op returning the current version.
    ///
    /// # Errors
    /// Returns `NotFound` if the source record is absent, `DuplicateKey` if
    /// the destination holds the key.
    pub fn transfer(&self, from: &str, to: &str, key: &str) -> VaultResult<u64> {
        if from == to {
            return self.read(from, key).map(|r| r.version);
        }

        let registry = self.registry();
        let lookup = |name: &str| {
            registry
                .get(name)
                .cloned()
                .ok_or_else(|| VaultError::CollectionNotFound(name.to_string()))
        };
        let source = lookup(from)?;
        let dest = lookup(to)?;

        // Collections lock in name order.
        let source_first = from < to;
        let (first, second) = if source_first {
            (&source, &dest)
        } else {
            (&dest, &source)
        };
        let mut first_table = first.write()?;
        let mut second_table = second.write()?;
        let (source_table, dest_table) = if source_first {
            (&mut *first_table, &mut *second_table)
        } else {
            (&mut *second_table, &mut *first_table)
        };

        let record = source_table
            .get(key)
            .ok_or_else(|| VaultError::not_found(from, key))?;
        if dest_table.contains(key) {
            return Err(VaultError::duplicate(to, key));
        }

        let moved = record.next(record.payload.clone(), record.position);
        let position = moved.position;
        source_table.take(key);
        let version = dest_table.store(moved).version;

        let mut first_index = first.spatial_write();
        let mut second_index = second.spatial_write();
        let (source_index, dest_index) = if source_first {
            (first_index.as_deref_mut(), second_index.as_deref_mut())
        } else {
            (second_index.as_deref_mut(), first_index.as_deref_mut())
        };
        if let Some(index) = source_index {
            index.remove(key);
        }
        if let Some(index) = dest_index {
            sync_entry(index, key, position);
        }

        debug!(from, to, key, version, "transferred record");
        Ok(version)
    }

    // ---- spatial ----

    /// The `k` records nearest to `origin`, ascending by distance, exact
    /// ties by key. Unindexed collections are scanned.
    ///
    /// # Errors
    /// Returns `InvalidPosition` for a non-finite origin, `IndexCorruption`
    /// if the index cannot be repaired.
    pub fn nearest(&self, collection: &str, origin: Point3, k: usize) -> VaultResult<Vec<Neighbor>> {
        check_position(Some(origin))?;
        self.collection(collection)?
            .nearest(&origin, k, self.config.verify_spatial_lookups)
    }

    /// Keys of records at most `radius` from `origin`.
    ///
    /// # Errors
    /// Returns `InvalidPosition` for a non-finite origin, `IndexCorruption`
    /// if the index cannot be repaired.
    pub fn within(&self, collection: &str, origin: Point3, radius: f64) -> VaultResult<BTreeSet<String>> {
        check_position(Some(origin))?;
        self.collection(collection)?
            .within(&origin, radius, self.config.verify_spatial_lookups)
    }

    /// Keys of records inside an axis-aligned box.
    ///
    /// # Errors
    /// Returns `IndexCorruption` if the index cannot be repaired.
    pub fn inside(&self, collection: &str, region: Aabb) -> VaultResult<BTreeSet<String>> {
        self.collection(collection)?
            .inside(&region, self.config.verify_spatial_lookups)
    }

    // ---- queries ----

    /// Records matching `predicate`. Nothing is evaluated until the query
    /// is iterated.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn query(&self, collection: &str, predicate: Predicate) -> VaultResult<Query<'_>> {
        self.collection(collection)?;
        Ok(Query::new(self, collection, predicate))
    }

    /// [`Vault::query`] with a text predicate such as
    /// `faction = 'red' AND within(0, 0, 0, 50)`.
    ///
    /// # Errors
    /// Returns `Parse` for malformed text, `CollectionNotFound` if absent.
    pub fn query_str(&self, collection: &str, predicate: &str) -> VaultResult<Query<'_>> {
        let predicate = parse_predicate(predicate)?;
        self.query(collection, predicate)
    }

    // ---- transactions ----

    /// Start a transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    // ---- persistence ----

    /// Write a record to the sink. On success the record is clean unless
    /// it changed while the write was in flight.
    ///
    /// Writes of one collection reach the sink one at a time, in the order
    /// their snapshots were taken, so an older envelope never lands after a
    /// newer one.
    ///
    /// # Errors
    /// Returns `NotFound` if absent, `Failure` if the sink fails. The record
    /// stays dirty on failure and the call may simply be repeated.
    pub fn persist(&self, collection: &str, key: &str) -> VaultResult<()> {
        let collection = self.collection(collection)?;
        let _writes = collection.sink_writes();
        let (record, revision) = collection
            .read()?
            .get_with_revision(key)
            .ok_or_else(|| VaultError::not_found(collection.name(), key))?;

        let sink_key = SinkKey::new(collection.name(), key).encode();
        let bytes = record.to_envelope()?;
        if let Err(e) = self.sink.put(&sink_key, &bytes) {
            warn!(collection = collection.name(), key, error = %e, "persist failed");
            return Err(e.into());
        }

        let clean = collection
            .write()
            .is_ok_and(|mut table| table.mark_clean(key, revision));
        debug!(collection = collection.name(), key, version = record.version, clean, "persisted record");
        Ok(())
    }

    /// Persist every dirty record of a collection, continuing past failures.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn persist_all(&self, collection: &str) -> VaultResult<PersistReport> {
        let mut dirty: Vec<String> = self
            .collection(collection)?
            .read()?
            .iter()
            .filter(|r| r.dirty)
            .map(|r| r.key.clone())
            .collect();
        dirty.sort_unstable();

        let mut report = PersistReport::default();
        for key in dirty {
            match self.persist(collection, &key) {
                Ok(()) => report.persisted.push(key),
                // Removed since the snapshot.
                Err(VaultError::NotFound { .. }) => {}
                Err(e) => report.failed.push((key, e)),
            }
        }

        debug!(
            collection,
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            "persisted collection"
        );
        Ok(report)
    }

    /// Drop a clean record from memory. Its durable copy stays in the sink.
    ///
    /// # Errors
    /// Returns `NotFound` if absent, `NotPersisted` if the record is dirty.
    pub fn evict(&self, collection: &str, key: &str) -> VaultResult<()> {
        let collection = self.collection(collection)?;
        collection.mutate(key, |table| {
            let record = table
                .get(key)
                .ok_or_else(|| VaultError::not_found(table.name(), key))?;
            if record.dirty {
                return Err(VaultError::NotPersisted {
                    collection: table.name().to_string(),
                    key: key.to_string(),
                });
            }
            table.take(key);
            Ok(())
        })?;
        trace!(collection = collection.name(), key, "evicted");
        Ok(())
    }

    /// Resident record, or its durable copy loaded into memory as clean.
    ///
    /// # Errors
    /// Returns `NotFound` if neither memory nor sink hold the key,
    /// `Failure` if the sink fails, `Codec` for a corrupt envelope.
    pub fn load(&self, collection: &str, key: &str) -> VaultResult<Record> {
        let collection = self.collection(collection)?;
        if let Some(record) = collection.read()?.get(key) {
            return Ok(Record::clone(record));
        }

        let sink_key = SinkKey::new(collection.name(), key).encode();
        let bytes = match self.sink.get(&sink_key) {
            Ok(bytes) => bytes,
            Err(SinkError::NotFound) => return Err(VaultError::not_found(collection.name(), key)),
            Err(e) => {
                warn!(collection = collection.name(), key, error = %e, "load failed");
                return Err(e.into());
            }
        };
        let record = Record::from_envelope(key, &bytes)?;
        check_position(record.position)?;

        // A concurrent insert or load wins over the durable copy.
        let loaded = collection.mutate(key, |table| {
            Ok(match table.get(key) {
                Some(resident) => Record::clone(resident),
                None => Record::clone(&table.store(record)),
            })
        })?;
        trace!(collection = collection.name(), key, version = loaded.version, "loaded");
        Ok(loaded)
    }

    /// Load many keys from the sink, e.g. after a restart. Results are
    /// positional.
    ///
    /// # Errors
    /// Returns `CollectionNotFound` if absent.
    pub fn restore<I>(&self, collection: &str, keys: I) -> VaultResult<Vec<VaultResult<Record>>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.collection(collection)?;
        let results: Vec<_> = keys
            .into_iter()
            .map(|key| self.load(collection, key.as_ref()))
            .collect();
        debug!(
            collection,
            restored = results.iter().filter(|r| r.is_ok()).count(),
            requested = results.len(),
            "restored collection"
        );
        Ok(results)
    }

    /// Delete a record's durable copy. A resident record becomes dirty.
    ///
    /// # Errors
    /// Returns `NotFound` if the sink holds nothing for the key, `Failure`
    /// if the sink fails.
    pub fn purge(&self, collection: &str, key: &str) -> VaultResult<()> {
        let collection = self.collection(collection)?;
        let _writes = collection.sink_writes();
        let sink_key = SinkKey::new(collection.name(), key).encode();
        match self.sink.delete(&sink_key) {
            Ok(()) => {}
            Err(SinkError::NotFound) => return Err(VaultError::not_found(collection.name(), key)),
            Err(e) => {
                warn!(collection = collection.name(), key, error = %e, "purge failed");
                return Err(e.into());
            }
        }

        if let Ok(mut table) = collection.write() {
            table.mark_dirty(key);
        }
        debug!(collection = collection.name(), key, "purged durable copy");
        Ok(())
    }

    pub(crate) fn position_update(&self, payload: &[u8]) -> VaultResult<PositionUpdate> {
        let update = self.codec.position(payload)?;
        if let PositionUpdate::Set(p) = update {
            check_position(Some(p))?;
        }
        Ok(update)
    }
}

pub(crate) fn check_position(position: Option<Point3>) -> VaultResult<()> {
    match position {
        Some(p) if !p.is_finite() => Err(VaultError::InvalidPosition(p)),
        _ => Ok(()),
    }
}
