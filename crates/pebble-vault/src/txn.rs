//! Optimistic transactions.
//!
//! A transaction stages operations against a private working copy and holds
//! no lock between calls. The first time it touches a key it remembers the
//! key's revision (or its absence). `commit` takes the record locks of every
//! touched collection in name order, checks that nothing it observed has
//! changed, and applies the whole working copy before releasing any lock.
//!
//! ```text
//!   Open ──stage──▶ Staging ──commit──▶ Committed
//!     │                │
//!     └────────────────┴──rollback/drop/conflict──▶ RolledBack
//! ```

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use bytes::Bytes;
use pebble_spatial::Point3;
use tracing::{debug, trace};

use crate::collection::{Collection, sync_entry};
use crate::error::{VaultError, VaultResult};
use crate::record::Record;
use crate::vault::{Vault, check_position};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Nothing staged yet.
    Open,
    /// At least one operation staged.
    Staging,
    /// Applied to the live store.
    Committed,
    /// Discarded.
    RolledBack,
}

/// An operation recorded by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOp {
    Insert { collection: String, key: String },
    Update { collection: String, key: String },
    Patch { collection: String, key: String },
    Remove { collection: String, key: String },
    Relocate { collection: String, key: String },
    /// Write the committed record to the sink after the apply step.
    Persist { collection: String, key: String },
}

impl StagedOp {
    /// Collection this operation targets.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Patch { collection, .. }
            | Self::Remove { collection, .. }
            | Self::Relocate { collection, .. }
            | Self::Persist { collection, .. } => collection,
        }
    }

    /// Record key this operation targets.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. }
            | Self::Update { key, .. }
            | Self::Patch { key, .. }
            | Self::Remove { key, .. }
            | Self::Relocate { key, .. }
            | Self::Persist { key, .. } => key,
        }
    }
}

/// Result of a staged persist, run after the commit applied.
#[derive(Debug)]
pub struct PersistOutcome {
    pub collection: String,
    pub key: String,
    pub result: VaultResult<()>,
}

/// Summary of a successful commit.
#[derive(Debug)]
pub struct CommitReceipt {
    /// Transaction id, unique per vault.
    pub id: u64,
    /// Number of staged operations.
    pub ops: usize,
    /// Number of records written or removed.
    pub written: usize,
    /// Staged persists in staging order.
    pub persisted: Vec<PersistOutcome>,
}

/// Working-copy state of one touched key.
#[derive(Debug)]
struct Touched {
    /// Live revision when first touched, `None` if absent.
    observed: Option<u64>,
    /// Staged state, `None` if absent.
    current: Option<Record>,
    modified: bool,
}

impl Touched {
    fn set(&mut self, record: Record) -> u64 {
        let version = record.version;
        self.current = Some(record);
        self.modified = true;
        version
    }
}

type SlotKey = (Arc<str>, String);

/// A batch of operations applied atomically by [`Transaction::commit`].
///
/// Dropping an uncommitted transaction rolls it back.
pub struct Transaction<'v> {
    vault: &'v Vault,
    id: u64,
    state: TxnState,
    ops: Vec<StagedOp>,
    collections: BTreeMap<Arc<str>, Arc<Collection>>,
    working: BTreeMap<SlotKey, Touched>,
}

impl<'v> Transaction<'v> {
    pub(crate) fn new(vault: &'v Vault) -> Self {
        let id = vault.next_txn_id();
        trace!(txn = id, "begin");
        Self {
            vault,
            id,
            state: TxnState::Open,
            ops: Vec::new(),
            collections: BTreeMap::new(),
            working: BTreeMap::new(),
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Operations staged so far.
    #[must_use]
    pub fn ops(&self) -> &[StagedOp] {
        &self.ops
    }

    /// Working-copy entry for `key`, observing the live record on first touch.
    fn touch(&mut self, collection: &str, key: &str) -> VaultResult<&mut Touched> {
        let coll = match self.collections.get(collection) {
            Some(coll) => Arc::clone(coll),
            None => {
                let coll = self.vault.collection(collection)?;
                self.collections
                    .insert(Arc::clone(coll.shared_name()), Arc::clone(&coll));
                coll
            }
        };

        match self
            .working
            .entry((Arc::clone(coll.shared_name()), key.to_string()))
        {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let live = coll.read()?.get_with_revision(key);
                let (current, observed) = match live {
                    Some((record, revision)) => (Some(Record::clone(&record)), Some(revision)),
                    None => (None, None),
                };
                Ok(entry.insert(Touched {
                    observed,
                    current,
                    modified: false,
                }))
            }
        }
    }

    fn stage(&mut self, op: StagedOp) {
        trace!(txn = self.id, ?op, "staged");
        self.ops.push(op);
        self.state = TxnState::Staging;
    }

    /// Staged view of a record.
    ///
    /// # Errors
    /// Returns `NotFound` if the record is absent in the working copy.
    pub fn read(&mut self, collection: &str, key: &str) -> VaultResult<Record> {
        self.touch(collection, key)?
            .current
            .clone()
            .ok_or_else(|| VaultError::not_found(collection, key))
    }

    /// Stage an insert.
    ///
    /// # Errors
    /// Returns `DuplicateKey` if the key exists in the working copy.
    pub fn insert(
        &mut self,
        collection: &str,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
        position: Option<Point3>,
    ) -> VaultResult<u64> {
        let key = key.into();
        let payload = payload.into();
        let position = match position {
            Some(p) => Some(p),
            None => self.vault.position_update(&payload)?.apply(None),
        };
        check_position(position)?;

        let touched = self.touch(collection, &key)?;
        if touched.current.is_some() {
            return Err(VaultError::duplicate(collection, &key));
        }
        let version = touched.set(Record::fresh(key.clone(), payload, position));

        self.stage(StagedOp::Insert {
            collection: collection.to_string(),
            key,
        });
        Ok(version)
    }

    /// Stage a full payload replace.
    ///
    /// # Errors
    /// Returns `NotFound` if the record is absent in the working copy.
    pub fn update(&mut self, collection: &str, key: &str, payload: impl Into<Bytes>) -> VaultResult<u64> {
        let payload = payload.into();
        let moved = self.vault.position_update(&payload)?;

        let touched = self.touch(collection, key)?;
        let current = touched
            .current
            .as_ref()
            .ok_or_else(|| VaultError::not_found(collection, key))?;
        let next = current.next(payload, moved.apply(current.position));
        let version = touched.set(next);

        self.stage(StagedOp::Update {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(version)
    }

    /// Stage a field-level merge.
    ///
    /// # Errors
    /// Returns `NotFound` if the record is absent in the working copy,
    /// `Codec` if the payloads cannot merge.
    pub fn patch(&mut self, collection: &str, key: &str, partial: impl Into<Bytes>) -> VaultResult<u64> {
        let partial = partial.into();
        let moved = self.vault.position_update(&partial)?;
        let vault = self.vault;

        let touched = self.touch(collection, key)?;
        let current = touched
            .current
            .as_ref()
            .ok_or_else(|| VaultError::not_found(collection, key))?;
        let merged = vault.codec().merge(&current.payload, &partial)?;
        let next = current.next(merged, moved.apply(current.position));
        let version = touched.set(next);

        self.stage(StagedOp::Patch {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(version)
    }

    /// Stage a position change.
    ///
    /// # Errors
    /// Returns `NotFound` if the record is absent in the working copy.
    pub fn relocate(&mut self, collection: &str, key: &str, position: Option<Point3>) -> VaultResult<u64> {
        check_position(position)?;

        let touched = self.touch(collection, key)?;
        let current = touched
            .current
            .as_ref()
            .ok_or_else(|| VaultError::not_found(collection, key))?;
        let next = current.next(current.payload.clone(), position);
        let version = touched.set(next);

        self.stage(StagedOp::Relocate {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(version)
    }

    /// Stage a removal, returning the removed record with its final version.
    ///
    /// # Errors
    /// Returns `NotFound` if the record is absent in the working copy.
    pub fn remove(&mut self, collection: &str, key: &str) -> VaultResult<Record> {
        let touched = self.touch(collection, key)?;
        let current = touched
            .current
            .take()
            .ok_or_else(|| VaultError::not_found(collection, key))?;
        let removed = current.next(current.payload.clone(), current.position);
        touched.modified = true;

        self.stage(StagedOp::Remove {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(removed)
    }

    /// Stage a persist. It runs after the commit has applied, and its
    /// outcome is reported in the receipt.
    ///
    /// # Errors
    /// Returns `NotFound` if the record is absent in the working copy.
    pub fn persist(&mut self, collection: &str, key: &str) -> VaultResult<()> {
        if self.touch(collection, key)?.current.is_none() {
            return Err(VaultError::not_found(collection, key));
        }

        self.stage(StagedOp::Persist {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    /// Apply every staged operation atomically, then run staged persists.
    ///
    /// # Errors
    /// Returns `Conflict` if a touched key or collection changed since it
    /// was observed. Nothing is applied in that case and the whole
    /// transaction must be retried.
    pub fn commit(mut self) -> VaultResult<CommitReceipt> {
        let written = match self.apply() {
            Ok(written) => written,
            Err(e) => {
                self.state = TxnState::RolledBack;
                debug!(txn = self.id, error = %e, "commit failed");
                return Err(e);
            }
        };
        self.state = TxnState::Committed;

        let ops = std::mem::take(&mut self.ops);
        let persisted = ops
            .iter()
            .filter(|op| matches!(op, StagedOp::Persist { .. }))
            .map(|op| PersistOutcome {
                collection: op.collection().to_string(),
                key: op.key().to_string(),
                result: self.vault.persist(op.collection(), op.key()),
            })
            .collect();

        debug!(txn = self.id, ops = ops.len(), written, "committed");
        Ok(CommitReceipt {
            id: self.id,
            ops: ops.len(),
            written,
            persisted,
        })
    }

    /// Discard the working copy.
    pub fn rollback(mut self) {
        self.state = TxnState::RolledBack;
        debug!(txn = self.id, ops = self.ops.len(), "rolled back");
    }

    fn apply(&self) -> VaultResult<usize> {
        // Registry -> records -> spatial, collections in name order.
        let registry = self.vault.registry();
        for (name, coll) in &self.collections {
            match registry.get(name) {
                Some(live) if Arc::ptr_eq(live, coll) => {}
                _ => return Err(VaultError::Conflict(format!("collection {name} was dropped"))),
            }
        }

        let mut tables = BTreeMap::new();
        for (name, coll) in &self.collections {
            let table = coll
                .write()
                .map_err(|_| VaultError::Conflict(format!("collection {name} was dropped")))?;
            tables.insert(&**name, table);
        }

        for ((name, key), touched) in &self.working {
            let live = tables.get(&**name).and_then(|table| table.revision(key));
            if live != touched.observed {
                return Err(VaultError::Conflict(format!("{name}/{key} changed since it was read")));
            }
        }

        let mut indexes: BTreeMap<&str, _> = self
            .collections
            .iter()
            .filter_map(|(name, coll)| coll.spatial_write().map(|index| (&**name, index)))
            .collect();

        let mut written = 0;
        for ((name, key), touched) in &self.working {
            if !touched.modified {
                continue;
            }
            let Some(table) = tables.get_mut(&**name) else {
                continue;
            };

            match &touched.current {
                Some(record) => {
                    table.store(record.clone());
                }
                None => {
                    table.take(key);
                }
            }
            if let Some(index) = indexes.get_mut(&**name) {
                sync_entry(index, key, touched.current.as_ref().and_then(|r| r.position));
            }
            written += 1;
        }

        Ok(written)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Open | TxnState::Staging) {
            self.state = TxnState::RolledBack;
            debug!(txn = self.id, ops = self.ops.len(), "rolled back on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        let vault = Vault::new();
        vault.create_collection("fleet", true).unwrap();
        vault
    }

    #[test]
    fn test_state_machine() {
        let vault = vault();
        let mut txn = vault.begin();
        assert_eq!(txn.state(), TxnState::Open);

        txn.insert("fleet", "ship-1", "{}", None).unwrap();
        assert_eq!(txn.state(), TxnState::Staging);
        assert_eq!(txn.ops().len(), 1);
        assert_eq!(txn.ops()[0].key(), "ship-1");

        let receipt = txn.commit().unwrap();
        assert_eq!(receipt.ops, 1);
        assert_eq!(receipt.written, 1);
    }

    #[test]
    fn test_failed_op_is_not_recorded() {
        let vault = vault();
        let mut txn = vault.begin();
        assert!(txn.update("fleet", "missing", "{}").is_err());
        assert_eq!(txn.state(), TxnState::Open);
        assert!(txn.ops().is_empty());

        txn.insert("fleet", "ship-1", "{}", None).unwrap();
        txn.commit().unwrap();
        assert_eq!(vault.read("fleet", "ship-1").unwrap().version, 1);
    }

    #[test]
    fn test_reinsert_after_remove_starts_over() {
        let vault = vault();
        vault.insert("fleet", "ship-1", "{}", None).unwrap();
        vault.update("fleet", "ship-1", "{}").unwrap();

        let mut txn = vault.begin();
        assert_eq!(txn.remove("fleet", "ship-1").unwrap().version, 3);
        assert_eq!(txn.insert("fleet", "ship-1", "{}", None).unwrap(), 1);
        txn.commit().unwrap();

        // Same as a remove and insert outside a transaction.
        assert_eq!(vault.read("fleet", "ship-1").unwrap().version, 1);
        vault.remove("fleet", "ship-1").unwrap();
        assert_eq!(vault.insert("fleet", "ship-1", "{}", None).unwrap(), 1);
    }

    #[test]
    fn test_recreated_collection_conflicts() {
        let vault = vault();
        let mut txn = vault.begin();
        txn.insert("fleet", "ship-1", "{}", None).unwrap();

        vault.drop_collection("fleet").unwrap();
        vault.create_collection("fleet", true).unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
        assert_eq!(vault.stats("fleet").unwrap().records, 0);
    }
}
