//! Balanced, array-backed 3-d tree.
//!
//! The tree is implicit: entries are arranged in place so that for every
//! range `[lo, hi)` the median `mid = lo + (hi - lo) / 2` splits the range on
//! axis `depth % 3`. Everything in `[lo, mid)` is `<=` the median along that
//! axis and everything in `(mid, hi)` is `>=` it.
//!
//! ```text
//!   depth 0 (x)          [ a b c | M | d e f ]
//!   depth 1 (y)     [ a | b | c ]       [ d | e | f ]
//! ```
//!
//! The tree is immutable once built. Incremental writes are handled by
//! `PointIndex`, which keeps an overlay and rebuilds the tree when the
//! overlay grows too large.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use smallvec::SmallVec;

use crate::{Aabb, Point3};

/// A keyed point stored in the tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub key: String,
    pub point: Point3,
}

/// A nearest-neighbor result.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbor {
    /// Key of the matched point.
    pub key: String,
    /// Euclidean distance from the query origin.
    pub distance: f64,
}

/// Static balanced 3-d tree over keyed points.
#[derive(Debug, Default, Clone)]
pub struct KdTree {
    entries: Vec<Entry>,
}

impl KdTree {
    /// Build a balanced tree from `entries` in O(n log n).
    #[must_use]
    pub fn build(mut entries: Vec<Entry>) -> Self {
        arrange(&mut entries, 0);
        Self { entries }
    }

    /// Number of entries in the tree (including ones the caller considers stale).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the tree is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in tree order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Offer every non-skipped entry that could beat the current worst
    /// candidate to `heap`.
    pub(crate) fn nearest_into<'a>(
        &'a self,
        origin: &Point3,
        heap: &mut KnnHeap<'a>,
        skip: &dyn Fn(&str) -> bool,
    ) {
        self.nearest_in(0, self.entries.len(), 0, origin, heap, skip);
    }

    fn nearest_in<'a>(
        &'a self,
        lo: usize,
        hi: usize,
        depth: usize,
        origin: &Point3,
        heap: &mut KnnHeap<'a>,
        skip: &dyn Fn(&str) -> bool,
    ) {
        if lo >= hi {
            return;
        }

        let mid = lo + (hi - lo) / 2;
        let entry = &self.entries[mid];
        if !skip(&entry.key) {
            heap.offer(origin.distance_squared(&entry.point), &entry.key);
        }

        let axis = depth % 3;
        let diff = origin.axis(axis) - entry.point.axis(axis);
        let (near, far) = if diff < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };

        self.nearest_in(near.0, near.1, depth + 1, origin, heap, skip);

        // Equal plane distance can still hold a tie that wins on key order.
        if !heap.is_full() || diff * diff <= heap.worst_distance_squared() {
            self.nearest_in(far.0, far.1, depth + 1, origin, heap, skip);
        }
    }

    /// Visit every non-skipped entry within `radius` of `origin`.
    pub(crate) fn within(
        &self,
        origin: &Point3,
        radius: f64,
        skip: &dyn Fn(&str) -> bool,
        mut hit: impl FnMut(&Entry),
    ) {
        self.visit(
            |axis, split| {
                let diff = origin.axis(axis) - split;
                let reach = diff.abs() <= radius;
                (diff <= 0.0 || reach, diff >= 0.0 || reach)
            },
            |entry| {
                if origin.distance(&entry.point) <= radius && !skip(&entry.key) {
                    hit(entry);
                }
            },
        );
    }

    /// Visit every non-skipped entry inside `aabb`.
    pub(crate) fn inside(&self, aabb: &Aabb, skip: &dyn Fn(&str) -> bool, mut hit: impl FnMut(&Entry)) {
        self.visit(
            |axis, split| (aabb.min.axis(axis) <= split, aabb.max.axis(axis) >= split),
            |entry| {
                if aabb.contains(&entry.point) && !skip(&entry.key) {
                    hit(entry);
                }
            },
        );
    }

    /// Depth-first traversal. `descend` receives the split axis and value
    /// and answers whether to enter the (lower, upper) halves.
    fn visit(
        &self,
        mut descend: impl FnMut(usize, f64) -> (bool, bool),
        mut hit: impl FnMut(&Entry),
    ) {
        let mut stack: SmallVec<[(usize, usize, usize); 32]> = SmallVec::new();
        stack.push((0, self.entries.len(), 0));

        while let Some((lo, hi, depth)) = stack.pop() {
            if lo >= hi {
                continue;
            }

            let mid = lo + (hi - lo) / 2;
            let entry = &self.entries[mid];
            hit(entry);

            let axis = depth % 3;
            let (lower, upper) = descend(axis, entry.point.axis(axis));
            if lower {
                stack.push((lo, mid, depth + 1));
            }
            if upper {
                stack.push((mid + 1, hi, depth + 1));
            }
        }
    }
}

fn arrange(slice: &mut [Entry], depth: usize) {
    if slice.len() <= 1 {
        return;
    }

    let axis = depth % 3;
    let mid = slice.len() / 2;
    slice.select_nth_unstable_by(mid, |a, b| a.point.axis(axis).total_cmp(&b.point.axis(axis)));

    let (lower, rest) = slice.split_at_mut(mid);
    arrange(lower, depth + 1);
    arrange(&mut rest[1..], depth + 1);
}

/// Candidate ordered by `(distance², key)` so the heap top is the worst.
#[derive(Debug)]
struct Candidate<'a> {
    distance_sq: f64,
    key: &'a str,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_sq
            .total_cmp(&other.distance_sq)
            .then_with(|| self.key.cmp(other.key))
    }
}

/// Bounded max-heap keeping the `k` best candidates.
#[derive(Debug)]
pub(crate) struct KnnHeap<'a> {
    k: usize,
    heap: BinaryHeap<Candidate<'a>>,
}

impl<'a> KnnHeap<'a> {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(1024) + 1),
        }
    }

    pub(crate) fn offer(&mut self, distance_sq: f64, key: &'a str) {
        if self.k == 0 {
            return;
        }

        let candidate = Candidate { distance_sq, key };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    pub(crate) fn worst_distance_squared(&self) -> f64 {
        self.heap.peek().map_or(f64::INFINITY, |c| c.distance_sq)
    }

    /// Results ascending by distance, ties by key.
    pub(crate) fn into_sorted(self) -> Vec<Neighbor> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                key: c.key.to_owned(),
                distance: c.distance_sq.sqrt(),
            })
            .collect()
    }
}
