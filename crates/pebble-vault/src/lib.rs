//! Spatially indexed, transactional in-memory record store.
//!
//! A [`Vault`] holds named collections of keyed records. Each record has an
//! opaque payload, an optional 3D position, a version and a dirty flag.
//! Collections may carry a spatial index answering nearest-neighbor, radius
//! and box queries. Writes are single operations or optimistic
//! [`Transaction`]s; persistence to a [`DurableSink`] is always explicit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Vault                                                              │
//! │    - RwLock<registry: name → Collection>                            │
//! │    - PayloadCodec (decode / merge / position)                       │
//! │    - DurableSink (put / get / delete)                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────────┐
//! │  Collection                  │   │  Transaction                     │
//! │    RwLock<RecordTable>       │◀──│    working copy + revisions      │
//! │    RwLock<PointIndex>?       │   │    commit: lock, check, apply    │
//! └──────────────────────────────┘   └──────────────────────────────────┘
//! ```
//!
//! Lock order is registry, then record tables, then spatial indexes, with
//! collections taken in ascending name order. The sink is never called
//! while a collection lock is held.
//!
//! # Usage
//!
//! ```
//! use pebble_spatial::Point3;
//! use pebble_vault::Vault;
//!
//! let vault = Vault::new();
//! vault.create_collection("fleet", true)?;
//! vault.insert("fleet", "ship-1", r#"{"faction":"red"}"#, Some(Point3::new(0.0, 0.0, 0.0)))?;
//! vault.insert("fleet", "ship-2", r#"{"faction":"blue"}"#, Some(Point3::new(10.0, 0.0, 0.0)))?;
//!
//! let nearest = vault.nearest("fleet", Point3::new(1.0, 0.0, 0.0), 1)?;
//! assert_eq!(nearest[0].key, "ship-1");
//!
//! let red = vault.query_str("fleet", "faction = 'red'")?.keys()?;
//! assert_eq!(red, ["ship-1"]);
//!
//! let mut txn = vault.begin();
//! txn.patch("fleet", "ship-2", r#"{"faction":"red"}"#)?;
//! txn.persist("fleet", "ship-2")?;
//! let receipt = txn.commit()?;
//! assert!(receipt.persisted[0].result.is_ok());
//! assert!(!vault.read("fleet", "ship-2")?.dirty);
//! # Ok::<(), pebble_vault::VaultError>(())
//! ```

mod codec;
mod collection;
mod config;
mod error;
mod keys;
mod query;
mod record;
mod sink;
mod table;
mod txn;
mod vault;

pub use codec::{CodecError, JsonCodec, PayloadCodec, PositionUpdate};
pub use collection::CollectionStats;
pub use config::VaultConfig;
pub use error::{ErrorKind, VaultError, VaultResult};
pub use keys::SinkKey;
pub use pebble_query::{ParseError, Predicate};
pub use pebble_spatial::{Aabb, Neighbor, Point3};
pub use query::{Query, QueryIter};
pub use record::{NewRecord, Record};
pub use sink::{DurableSink, MemorySink, SinkError};
pub use table::RecordTable;
pub use txn::{CommitReceipt, PersistOutcome, StagedOp, Transaction, TxnState};
pub use vault::{PersistReport, Vault, VaultBuilder};
