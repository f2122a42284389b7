//! Spatial index for PebbleVault collections.
//!
//! Keys are mapped to 3D points and answered with nearest-neighbor, radius
//! and box queries. The index is derived data: it can always be rebuilt from
//! the record store with [`PointIndex::rebuild`].
//!
//! # Example
//!
//! ```
//! use pebble_spatial::{Point3, PointIndex};
//!
//! let mut index = PointIndex::new();
//! index.upsert("ship-1", Point3::new(0.0, 0.0, 0.0));
//! index.upsert("ship-2", Point3::new(10.0, 0.0, 0.0));
//!
//! let nearest = index.nearest(&Point3::new(1.0, 0.0, 0.0), 1);
//! assert_eq!(nearest[0].key, "ship-1");
//! assert_eq!(nearest[0].distance, 1.0);
//! ```

pub mod index;
pub mod kdtree;
pub mod point;

pub use index::{DEFAULT_OVERLAY_LIMIT, PointIndex};
pub use kdtree::{Entry, KdTree, Neighbor};
pub use point::{Aabb, Point3};
