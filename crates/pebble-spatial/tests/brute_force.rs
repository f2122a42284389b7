//! Index queries compared against an O(n) scan over random point sets.

use std::collections::BTreeSet;

use pebble_spatial::{Aabb, Point3, PointIndex};
use proptest::prelude::*;

fn coord() -> impl Strategy<Value = f64> {
    // Small integer grid so exact distance ties are common.
    (-8i32..8).prop_map(f64::from)
}

fn point() -> impl Strategy<Value = Point3> {
    (coord(), coord(), coord()).prop_map(|(x, y, z)| Point3::new(x, y, z))
}

/// Upserts and removes applied to a fresh index with a tiny overlay limit,
/// so queries run against a mix of tree entries, stale entries and pending keys.
#[derive(Clone, Debug)]
enum Op {
    Upsert(u8, Point3),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..48, point()).prop_map(|(k, p)| Op::Upsert(k, p)),
        1 => (0u8..48).prop_map(Op::Remove),
    ]
}

fn apply(ops: &[Op], overlay_limit: usize) -> (PointIndex, Vec<(String, Point3)>) {
    let mut index = PointIndex::with_overlay_limit(overlay_limit);
    let mut model = std::collections::BTreeMap::new();

    for op in ops {
        match op {
            Op::Upsert(k, p) => {
                let key = format!("key-{k:02}");
                index.upsert(&key, *p);
                model.insert(key, *p);
            }
            Op::Remove(k) => {
                let key = format!("key-{k:02}");
                index.remove(&key);
                model.remove(&key);
            }
        }
    }

    (index, model.into_iter().collect())
}

fn brute_nearest(points: &[(String, Point3)], origin: &Point3, k: usize) -> Vec<(String, f64)> {
    let mut all: Vec<_> = points
        .iter()
        .map(|(key, p)| (key.clone(), origin.distance_squared(p)))
        .collect();
    all.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    all.truncate(k);
    all.into_iter().map(|(key, d)| (key, d.sqrt())).collect()
}

proptest! {
    #[test]
    fn nearest_matches_brute_force(
        ops in prop::collection::vec(op(), 0..160),
        origin in point(),
        k in 0usize..12,
        overlay_limit in 0usize..10,
    ) {
        let (index, points) = apply(&ops, overlay_limit);
        let got: Vec<_> = index
            .nearest(&origin, k)
            .into_iter()
            .map(|n| (n.key, n.distance))
            .collect();
        prop_assert_eq!(got, brute_nearest(&points, &origin, k));
    }

    #[test]
    fn within_matches_brute_force(
        ops in prop::collection::vec(op(), 0..160),
        origin in point(),
        radius in 0.0f64..12.0,
        overlay_limit in 0usize..10,
    ) {
        let (index, points) = apply(&ops, overlay_limit);
        let expected: BTreeSet<String> = points
            .iter()
            .filter(|(_, p)| origin.distance(p) <= radius)
            .map(|(key, _)| key.clone())
            .collect();
        prop_assert_eq!(index.within(&origin, radius), expected);
    }

    #[test]
    fn inside_matches_brute_force(
        ops in prop::collection::vec(op(), 0..160),
        a in point(),
        b in point(),
    ) {
        let (index, points) = apply(&ops, 3);
        let aabb = Aabb::from_corners(a, b);
        let expected: BTreeSet<String> = points
            .iter()
            .filter(|(_, p)| aabb.contains(p))
            .map(|(key, _)| key.clone())
            .collect();
        prop_assert_eq!(index.inside(&aabb), expected);
    }

    #[test]
    fn bookkeeping_stays_consistent(ops in prop::collection::vec(op(), 0..200)) {
        let (index, points) = apply(&ops, 5);
        prop_assert_eq!(index.len(), points.len());
        prop_assert!(index.find_inconsistency().is_none());
    }
}
