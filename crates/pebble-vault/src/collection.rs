//! A named collection: a record table plus an optional spatial index.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Collection "fleet"                          │
//! │    records: RwLock<RecordTable>   (1st lock) │
//! │    spatial: RwLock<PointIndex>    (2nd lock) │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The spatial lock is only ever taken while the record lock is held, so a
//! writer holding the record lock sees a quiescent index and readers never
//! observe a record without its index entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use pebble_spatial::{Aabb, Neighbor, Point3, PointIndex};
use tracing::{debug, error, warn};

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::record::Record;
use crate::table::RecordTable;

/// Record counts of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    /// Resident records.
    pub records: usize,
    /// Resident records with unpersisted changes.
    pub dirty: usize,
    /// Resident records carrying a position.
    pub positioned: usize,
    /// Spatial index entries, `None` if the collection is not indexed.
    pub indexed: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Collection {
    name: Arc<str>,
    records: RwLock<RecordTable>,
    spatial: Option<RwLock<PointIndex>>,
    /// Serializes sink writes of this collection. Never taken while the
    /// record lock is held.
    sink_writes: Mutex<()>,
}

impl Collection {
    pub(crate) fn new(name: Arc<str>, indexed: bool, config: &VaultConfig) -> Self {
        Self {
            records: RwLock::new(RecordTable::new(Arc::clone(&name))),
            spatial: indexed
                .then(|| RwLock::new(PointIndex::with_overlay_limit(config.index_overlay_limit))),
            sink_writes: Mutex::new(()),
            name,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn is_indexed(&self) -> bool {
        self.spatial.is_some()
    }

    /// Exclusive right to write this collection's records to the sink.
    /// Take it before the record lock, never while holding it.
    pub(crate) fn sink_writes(&self) -> MutexGuard<'_, ()> {
        self.sink_writes.lock()
    }

    /// Shared access to the records. Fails once the collection is dropped.
    pub(crate) fn read(&self) -> VaultResult<RwLockReadGuard<'_, RecordTable>> {
        let table = self.records.read();
        if table.is_dropped() {
            return Err(VaultError::CollectionNotFound(self.name.to_string()));
        }
        Ok(table)
    }

    /// Exclusive access to the records. Fails once the collection is dropped.
    pub(crate) fn write(&self) -> VaultResult<RwLockWriteGuard<'_, RecordTable>> {
        let table = self.records.write();
        if table.is_dropped() {
            return Err(VaultError::CollectionNotFound(self.name.to_string()));
        }
        Ok(table)
    }

    /// Exclusive access to the index. Callers must already hold the record lock.
    pub(crate) fn spatial_write(&self) -> Option<RwLockWriteGuard<'_, PointIndex>> {
        self.spatial.as_ref().map(|spatial| spatial.write())
    }

    /// Run `f` under the record write lock, then mirror the resulting
    /// position of `key` into the index before the lock is released.
    pub(crate) fn mutate<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut RecordTable) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let mut table = self.write()?;
        let out = f(&mut table)?;

        if let Some(mut index) = self.spatial_write() {
            sync_entry(&mut index, key, table.get(key).and_then(|r| r.position));
        }

        Ok(out)
    }

    /// Unlinked from the registry: release every record and index entry.
    pub(crate) fn clear(&self) {
        let mut table = self.records.write();
        table.mark_dropped();
        if let Some(mut index) = self.spatial_write() {
            index.clear();
        }
    }

    pub(crate) fn stats(&self) -> VaultResult<CollectionStats> {
        let table = self.read()?;
        Ok(CollectionStats {
            records: table.len(),
            dirty: table.dirty(),
            positioned: table.positioned(),
            indexed: self.spatial.as_ref().map(|s| s.read().len()),
        })
    }

    /// Rebuild the index from the positioned records.
    pub(crate) fn rebuild_index(&self) -> VaultResult<()> {
        let table = self.read()?;
        if let Some(mut index) = self.spatial_write() {
            rebuild_from(&mut index, &table);
            debug!(collection = %self.name, entries = index.len(), "rebuilt spatial index");
        }
        Ok(())
    }

    pub(crate) fn nearest(
        &self,
        origin: &Point3,
        k: usize,
        verify: bool,
    ) -> VaultResult<Vec<Neighbor>> {
        let table = self.read()?;
        match &self.spatial {
            Some(spatial) => self.lookup(&table, spatial, verify, |index| index.nearest(origin, k)),
            None => Ok(scan_nearest(&table, origin, k)),
        }
    }

    pub(crate) fn within(
        &self,
        origin: &Point3,
        radius: f64,
        verify: bool,
    ) -> VaultResult<BTreeSet<String>> {
        let table = self.read()?;
        match &self.spatial {
            Some(spatial) => self.lookup(&table, spatial, verify, |index| index.within(origin, radius)),
            None => Ok(scan(&table, |p| radius >= 0.0 && origin.distance(p) <= radius)),
        }
    }

    /// Records inside the sphere, read under one record lock so the
    /// candidate keys and their records come from the same state.
    pub(crate) fn within_records(
        &self,
        origin: &Point3,
        radius: f64,
        verify: bool,
    ) -> VaultResult<Vec<Arc<Record>>> {
        let table = self.read()?;
        let keys = match &self.spatial {
            Some(spatial) => self.lookup(&table, spatial, verify, |index| index.within(origin, radius))?,
            None => scan(&table, |p| radius >= 0.0 && origin.distance(p) <= radius),
        };
        Ok(keys.iter().filter_map(|key| table.get(key).cloned()).collect())
    }

    pub(crate) fn inside(&self, region: &Aabb, verify: bool) -> VaultResult<BTreeSet<String>> {
        let table = self.read()?;
        match &self.spatial {
            Some(spatial) => self.lookup(&table, spatial, verify, |index| index.inside(region)),
            None => Ok(scan(&table, |p| region.contains(p))),
        }
    }

    /// Run an index query, cross-checking the hits against `table`. On a
    /// mismatch the index is rebuilt and the query retried once.
    fn lookup<T: Hits>(
        &self,
        table: &RecordTable,
        spatial: &RwLock<PointIndex>,
        verify: bool,
        query: impl Fn(&PointIndex) -> T,
    ) -> VaultResult<T> {
        {
            let index = spatial.read();
            let hits = query(&index);
            if !verify {
                return Ok(hits);
            }
            let Some(problem) = inconsistency(table, &index, &hits) else {
                return Ok(hits);
            };
            warn!(collection = %self.name, %problem, "spatial index corrupted, rebuilding");
        }

        // Writers need the record lock we hold, so nothing changes in between.
        let mut index = spatial.write();
        rebuild_from(&mut index, table);
        let index = RwLockWriteGuard::downgrade(index);

        let hits = query(&index);
        match inconsistency(table, &index, &hits) {
            None => Ok(hits),
            Some(problem) => {
                error!(collection = %self.name, %problem, "spatial index still corrupted after rebuild");
                Err(VaultError::IndexCorruption(self.name.to_string()))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn spatial_for_test(&self) -> Option<RwLockWriteGuard<'_, PointIndex>> {
        self.spatial_write()
    }
}

/// Keys returned by a spatial query.
trait Hits {
    fn keys(&self) -> impl Iterator<Item = &str>;
}

impl Hits for Vec<Neighbor> {
    fn keys(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|n| n.key.as_str())
    }
}

impl Hits for BTreeSet<String> {
    fn keys(&self) -> impl Iterator<Item = &str> {
        self.iter().map(String::as_str)
    }
}

/// Describe the first disagreement between index and table, if any.
///
/// Matching counts plus every entry agreeing with a positioned record means
/// the index holds exactly the positioned records.
fn inconsistency(table: &RecordTable, index: &PointIndex, hits: &impl Hits) -> Option<String> {
    if index.len() != table.positioned() {
        return Some(format!(
            "{} entries for {} positioned records",
            index.len(),
            table.positioned()
        ));
    }

    let disagrees = |key: &str| {
        let record = table.get(key).and_then(|r| r.position);
        record.is_none() || record != index.get(key)
    };
    if let Some(key) = hits.keys().find(|key| disagrees(key)) {
        return Some(format!("hit {key} has no matching record"));
    }
    if let Some((key, _)) = index
        .iter()
        .find(|(key, p)| table.get(key).and_then(|r| r.position) != Some(*p))
    {
        return Some(format!("entry {key} has no matching record"));
    }
    index
        .find_inconsistency()
        .map(|key| format!("tree entry {key} out of sync with its position"))
}

pub(crate) fn sync_entry(index: &mut PointIndex, key: &str, position: Option<Point3>) {
    match position {
        Some(p) => index.upsert(key, p),
        None => {
            index.remove(key);
        }
    }
}

fn rebuild_from(index: &mut PointIndex, table: &RecordTable) {
    index.rebuild(table.positions());
}

fn scan_nearest(table: &RecordTable, origin: &Point3, k: usize) -> Vec<Neighbor> {
    let mut all: Vec<(f64, &str)> = table
        .positions()
        .map(|(key, p)| (origin.distance_squared(&p), key))
        .collect();
    all.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    all.truncate(k);
    all.into_iter()
        .map(|(d, key)| Neighbor {
            key: key.to_string(),
            distance: d.sqrt(),
        })
        .collect()
}

fn scan(table: &RecordTable, hit: impl Fn(&Point3) -> bool) -> BTreeSet<String> {
    table
        .positions()
        .filter(|(_, p)| hit(p))
        .map(|(key, _)| key.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn fleet(indexed: bool) -> Collection {
        let c = Collection::new("fleet".into(), indexed, &VaultConfig::default());
        for (key, p) in [
            ("ship-1", Point3::new(0.0, 0.0, 0.0)),
            ("ship-2", Point3::new(10.0, 0.0, 0.0)),
            ("ship-3", Point3::new(0.0, 10.0, 0.0)),
        ] {
            c.mutate(key, |t| t.insert(key.to_string(), Bytes::new(), Some(p)))
                .unwrap();
        }
        c
    }

    #[test]
    fn test_mutate_mirrors_positions() {
        let c = fleet(true);
        assert_eq!(c.stats().unwrap().indexed, Some(3));

        c.mutate("ship-2", |t| t.update("ship-2", Bytes::new(), None))
            .unwrap();
        let stats = c.stats().unwrap();
        assert_eq!(stats.positioned, 2);
        assert_eq!(stats.indexed, Some(2));

        c.mutate("ship-3", |t| t.remove("ship-3")).unwrap();
        assert_eq!(c.stats().unwrap().indexed, Some(1));
    }

    #[test]
    fn test_failed_mutation_leaves_index_alone() {
        let c = fleet(true);
        let err = c
            .mutate("ghost", |t| t.update("ghost", Bytes::new(), Some(Point3::ORIGIN)))
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));
        assert_eq!(c.stats().unwrap().indexed, Some(3));
    }

    #[test]
    fn test_scan_matches_index() {
        let indexed = fleet(true);
        let scanned = fleet(false);
        let origin = Point3::new(1.0, 0.0, 0.0);

        assert_eq!(
            indexed.nearest(&origin, 2, true).unwrap(),
            scanned.nearest(&origin, 2, true).unwrap()
        );
        assert_eq!(
            indexed.within(&origin, 9.0, true).unwrap(),
            scanned.within(&origin, 9.0, true).unwrap()
        );
        let region = Aabb::from_corners(Point3::ORIGIN, Point3::new(10.0, 1.0, 1.0));
        assert_eq!(
            indexed.inside(&region, true).unwrap(),
            scanned.inside(&region, true).unwrap()
        );
    }

    #[test]
    fn test_orphan_entry_triggers_rebuild() {
        let c = fleet(true);
        c.spatial_for_test()
            .unwrap()
            .upsert("ghost", Point3::new(1.0, 0.0, 0.0));

        let nearest = c.nearest(&Point3::new(1.0, 0.0, 0.0), 1, true).unwrap();
        assert_eq!(nearest[0].key, "ship-1");
        assert_eq!(c.stats().unwrap().indexed, Some(3));
    }

    #[test]
    fn test_moved_entry_triggers_rebuild() {
        let c = fleet(true);
        c.spatial_for_test()
            .unwrap()
            .upsert("ship-2", Point3::new(50.0, 0.0, 0.0));

        // The stale entry answers the first attempt, the rebuilt index the retry.
        let hits = c.within(&Point3::new(50.0, 0.0, 0.0), 0.5, true).unwrap();
        assert!(hits.is_empty());

        let hits = c.within(&Point3::new(10.0, 0.0, 0.0), 0.5, true).unwrap();
        assert!(hits.contains("ship-2"));
    }

    #[test]
    fn test_swapped_entry_triggers_rebuild() {
        let c = fleet(true);
        {
            let mut index = c.spatial_for_test().unwrap();
            index.remove("ship-1");
            index.upsert("ghost", Point3::new(500.0, 500.0, 500.0));
        }

        // Counts still match and the nearest hit agrees with its record.
        let nearest = c.nearest(&Point3::new(1.0, 0.0, 0.0), 1, true).unwrap();
        assert_eq!(nearest[0].key, "ship-1");

        let index = c.spatial_for_test().unwrap();
        assert_eq!(index.get("ghost"), None);
        assert_eq!(index.get("ship-1"), Some(Point3::ORIGIN));
    }

    #[test]
    fn test_within_records_reads_one_state() {
        let c = fleet(true);
        let records = c.within_records(&Point3::ORIGIN, 10.0, true).unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["ship-1", "ship-2", "ship-3"]);
    }

    #[test]
    fn test_unverified_lookup_trusts_index() {
        let c = fleet(true);
        c.spatial_for_test()
            .unwrap()
            .upsert("ghost", Point3::new(1.0, 0.0, 0.0));

        let nearest = c.nearest(&Point3::new(1.0, 0.0, 0.0), 1, false).unwrap();
        assert_eq!(nearest[0].key, "ghost");
    }

    #[test]
    fn test_dropped_collection_rejects_access() {
        let c = fleet(true);
        c.clear();
        assert!(matches!(c.read(), Err(VaultError::CollectionNotFound(_))));
        assert!(matches!(
            c.mutate("ship-1", |t| t.remove("ship-1")),
            Err(VaultError::CollectionNotFound(_))
        ));
    }
}
