//! LMDB persistence for pebble vaults.
//!
//! [`LmdbSink`] implements [`DurableSink`](pebble_vault::DurableSink) on top of
//! LMDB (heed). Each record is stored as its bincode envelope under its
//! [`SinkKey`](pebble_vault::SinkKey) encoding.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pebble_lmdb::LmdbSink;
//! use pebble_vault::Vault;
//!
//! let sink = Arc::new(LmdbSink::open("data/vault")?);
//! let vault = Vault::builder().sink(sink.clone()).build();
//! vault.create_collection("fleet", true)?;
//!
//! // Bring back what an earlier process persisted.
//! let keys = sink.record_keys("fleet")?;
//! vault.restore("fleet", &keys)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod db;

pub use db::{DEFAULT_MAP_SIZE, LmdbSink};
