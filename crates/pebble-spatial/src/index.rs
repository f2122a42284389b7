//! Mutable point index: a balanced tree plus a small write overlay.
//!
//! Writes never restructure the tree directly. An upsert records the key as
//! *pending* (answered by a linear scan) and, if the key already had a tree
//! entry, marks that entry *stale* (skipped during traversal). Once the
//! overlay outgrows `overlay_limit` the tree is rebuilt balanced from the
//! authoritative position map.
//!
//! Invariant: the live tree entries are exactly `positions - pending`.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};

use crate::kdtree::{Entry, KdTree, KnnHeap, Neighbor};
use crate::{Aabb, Point3};

/// Default overlay size that triggers a rebuild.
pub const DEFAULT_OVERLAY_LIMIT: usize = 64;

/// Point index keyed by record key.
#[derive(Debug, Clone)]
pub struct PointIndex {
    /// Authoritative key -> position map.
    positions: HashMap<String, Point3>,
    /// Balanced tree over a past snapshot of `positions`.
    tree: KdTree,
    /// Tree entries that no longer reflect `positions`.
    stale: HashSet<String>,
    /// Live keys not represented by a valid tree entry.
    pending: HashSet<String>,
    overlay_limit: usize,
}

impl Default for PointIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PointIndex {
    /// Create an empty index with the default overlay limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_overlay_limit(DEFAULT_OVERLAY_LIMIT)
    }

    /// Create an empty index that rebuilds its tree once more than
    /// `overlay_limit` writes are outstanding.
    #[must_use]
    pub fn with_overlay_limit(overlay_limit: usize) -> Self {
        Self {
            positions: HashMap::new(),
            tree: KdTree::default(),
            stale: HashSet::new(),
            pending: HashSet::new(),
            overlay_limit,
        }
    }

    /// Number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Current position of `key`, if indexed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Point3> {
        self.positions.get(key).copied()
    }

    /// Iterate over all `(key, position)` entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Point3)> {
        self.positions.iter().map(|(k, p)| (k.as_str(), *p))
    }

    /// Number of outstanding overlay writes.
    #[must_use]
    pub fn overlay_len(&self) -> usize {
        self.stale.len() + self.pending.len()
    }

    /// Insert or move `key`. Idempotent.
    pub fn upsert(&mut self, key: &str, position: Point3) {
        match self.positions.get_mut(key) {
            Some(current) => {
                if *current == position {
                    return;
                }
                *current = position;
                if !self.pending.contains(key) {
                    self.stale.insert(key.to_owned());
                }
            }
            None => {
                self.positions.insert(key.to_owned(), position);
            }
        }

        self.pending.insert(key.to_owned());
        self.maybe_rebuild();
    }

    /// Remove `key`. Returns whether it was indexed; absent keys are a no-op.
    pub fn remove(&mut self, key: &str) -> bool {
        if self.positions.remove(key).is_none() {
            return false;
        }

        if !self.pending.remove(key) {
            self.stale.insert(key.to_owned());
        }
        self.maybe_rebuild();
        true
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.stale.clear();
        self.pending.clear();
        self.tree = KdTree::default();
    }

    /// Replace the whole index with `entries` and rebuild the tree.
    pub fn rebuild<I, K>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, Point3)>,
        K: Into<String>,
    {
        self.positions = entries.into_iter().map(|(k, p)| (k.into(), p)).collect();
        self.compact();
    }

    /// Rebuild the tree from the current positions and empty the overlay.
    pub fn compact(&mut self) {
        let entries = self
            .positions
            .iter()
            .map(|(key, point)| Entry {
                key: key.clone(),
                point: *point,
            })
            .collect();
        self.tree = KdTree::build(entries);
        self.stale.clear();
        self.pending.clear();
    }

    fn maybe_rebuild(&mut self) {
        if self.overlay_len() > self.overlay_limit {
            self.compact();
        }
    }

    /// The `k` nearest keys to `origin`, ascending by distance with exact
    /// ties broken by ascending key.
    #[must_use]
    pub fn nearest(&self, origin: &Point3, k: usize) -> Vec<Neighbor> {
        if k == 0 || self.positions.is_empty() {
            return Vec::new();
        }

        let mut heap = KnnHeap::new(k);
        let skip = |key: &str| self.stale.contains(key);
        self.tree.nearest_into(origin, &mut heap, &skip);

        for key in &self.pending {
            if let Some(point) = self.positions.get(key) {
                heap.offer(origin.distance_squared(point), key);
            }
        }

        heap.into_sorted()
    }

    /// All keys whose distance to `origin` is at most `radius`.
    #[must_use]
    pub fn within(&self, origin: &Point3, radius: f64) -> BTreeSet<String> {
        let mut hits = BTreeSet::new();
        if radius.is_nan() || radius < 0.0 {
            return hits;
        }

        let skip = |key: &str| self.stale.contains(key);
        self.tree.within(origin, radius, &skip, |entry| {
            hits.insert(entry.key.clone());
        });

        for key in &self.pending {
            if self
                .positions
                .get(key)
                .is_some_and(|p| origin.distance(p) <= radius)
            {
                hits.insert(key.clone());
            }
        }

        hits
    }

    /// All keys inside `aabb` (boundary inclusive).
    #[must_use]
    pub fn inside(&self, aabb: &Aabb) -> BTreeSet<String> {
        let mut hits = BTreeSet::new();

        let skip = |key: &str| self.stale.contains(key);
        self.tree.inside(aabb, &skip, |entry| {
            hits.insert(entry.key.clone());
        });

        for key in &self.pending {
            if self.positions.get(key).is_some_and(|p| aabb.contains(p)) {
                hits.insert(key.clone());
            }
        }

        hits
    }

    /// Check the overlay bookkeeping against the tree.
    ///
    /// Returns the first key whose tree entry is live but disagrees with the
    /// position map, or which is live in the map without any representation.
    #[must_use]
    pub fn find_inconsistency(&self) -> Option<&str> {
        let mut seen = 0usize;
        for entry in self.tree.iter() {
            if self.stale.contains(&entry.key) {
                continue;
            }
            match self.positions.get(&entry.key) {
                Some(p) if *p == entry.point && !self.pending.contains(&entry.key) => seen += 1,
                _ => return Some(entry.key.as_str()),
            }
        }

        if seen + self.pending.len() == self.positions.len() {
            return None;
        }

        self.positions
            .keys()
            .find(|key| !self.pending.contains(*key) && !self.tree.iter().any(|e| &e.key == *key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> PointIndex {
        let mut index = PointIndex::new();
        index.upsert("ship-1", Point3::new(0.0, 0.0, 0.0));
        index.upsert("ship-2", Point3::new(10.0, 0.0, 0.0));
        index.upsert("ship-3", Point3::new(0.0, 10.0, 0.0));
        index
    }

    #[test]
    fn test_fleet_nearest() {
        let index = fleet();
        let result = index.nearest(&Point3::new(1.0, 0.0, 0.0), 3);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].key, "ship-1");
        assert_eq!(result[0].distance, 1.0);
        assert_eq!(result[1].key, "ship-2");
        assert_eq!(result[1].distance, 9.0);
        assert_eq!(result[2].key, "ship-3");
        assert!((result[2].distance - 101f64.sqrt()).abs() < 1e-9);

        assert_eq!(index.nearest(&Point3::new(1.0, 0.0, 0.0), 2).len(), 2);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut index = fleet();
        index.upsert("ship-1", Point3::new(0.0, 0.0, 0.0));
        index.upsert("ship-1", Point3::new(0.0, 0.0, 0.0));
        assert_eq!(index.len(), 3);
        assert_eq!(index.nearest(&Point3::ORIGIN, 10).len(), 3);
    }

    #[test]
    fn test_moves_survive_compaction() {
        let mut index = fleet();
        index.compact();
        index.upsert("ship-2", Point3::new(0.5, 0.0, 0.0));
        assert_eq!(index.overlay_len(), 2);

        let nearest = index.nearest(&Point3::new(1.0, 0.0, 0.0), 1);
        assert_eq!(nearest[0].key, "ship-2");
        assert!(index.within(&Point3::new(10.0, 0.0, 0.0), 1.0).is_empty());
        assert!(index.find_inconsistency().is_none());
    }

    #[test]
    fn test_remove_tolerates_absent() {
        let mut index = fleet();
        assert!(index.remove("ship-2"));
        assert!(!index.remove("ship-2"));
        assert!(!index.remove("never"));
        assert_eq!(index.len(), 2);
        assert!(!index.within(&Point3::ORIGIN, 100.0).contains("ship-2"));
    }

    #[test]
    fn test_overlay_limit_triggers_rebuild() {
        let mut index = PointIndex::with_overlay_limit(4);
        for i in 0..10 {
            index.upsert(&format!("k{i}"), Point3::new(f64::from(i), 0.0, 0.0));
        }
        assert!(index.overlay_len() <= 4);
        assert_eq!(index.len(), 10);
        assert!(index.find_inconsistency().is_none());

        let nearest = index.nearest(&Point3::new(9.2, 0.0, 0.0), 3);
        let keys: Vec<_> = nearest.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, ["k9", "k8", "k7"]);
    }

    #[test]
    fn test_negative_or_nan_radius_is_empty() {
        let index = fleet();
        assert!(index.within(&Point3::ORIGIN, -1.0).is_empty());
        assert!(index.within(&Point3::ORIGIN, f64::NAN).is_empty());
        assert_eq!(index.within(&Point3::ORIGIN, 0.0).len(), 1);
    }

    #[test]
    fn test_rebuild_replaces_contents() {
        let mut index = fleet();
        index.rebuild([("solo", Point3::new(3.0, 3.0, 3.0))]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("solo"), Some(Point3::new(3.0, 3.0, 3.0)));
        assert_eq!(index.get("ship-1"), None);
        assert_eq!(index.overlay_len(), 0);
    }

    #[test]
    fn test_inside_box_mixes_tree_and_overlay() {
        let mut index = fleet();
        index.compact();
        index.upsert("probe", Point3::new(5.0, 5.0, 0.0));
        let hits = index.inside(&Aabb::from_corners(Point3::ORIGIN, Point3::new(5.0, 5.0, 0.0)));
        assert_eq!(hits.into_iter().collect::<Vec<_>>(), ["probe", "ship-1"]);
    }
}
