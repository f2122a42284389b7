//! LMDB-backed durable sink.

use std::path::Path;

use heed::{Database, Env, EnvOpenOptions, types::Bytes};
use pebble_vault::{DurableSink, SinkError, SinkKey};

/// Default LMDB map size.
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

const DATABASE_NAME: &str = "records";

/// LMDB environment holding one database of encoded record envelopes.
///
/// Keys are [`SinkKey`] encodings, so every record of a collection shares
/// a key prefix and can be enumerated with [`LmdbSink::record_keys`].
pub struct LmdbSink {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbSink {
    /// Open or create a sink at `path` with [`DEFAULT_MAP_SIZE`].
    ///
    /// # Errors
    /// Returns an error if the environment cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> heed::Result<Self> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Open or create a sink at `path`.
    ///
    /// # Errors
    /// Returns an error if the environment cannot be opened or created.
    ///
    /// # Safety
    /// Uses unsafe to call heed's open method which requires that the same
    /// environment is not opened twice in one process with different options.
    #[allow(unsafe_code)]
    pub fn open_with_map_size(path: impl AsRef<Path>, map_size: usize) -> heed::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        // SAFETY: callers open each path once per process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some(DATABASE_NAME))?;
        wtxn.commit()?;

        tracing::debug!(path = %path.display(), map_size, "opened lmdb sink");
        Ok(Self { env, db })
    }

    /// Store `value` under `key`.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn put_bytes(&self, key: &str, value: &[u8]) -> heed::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, key.as_bytes(), value)?;
        wtxn.commit()?;

        tracing::trace!(key, len = value.len(), "stored");
        Ok(())
    }

    /// Fetch the value under `key`, `None` if absent.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn get_bytes(&self, key: &str) -> heed::Result<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        let Some(bytes) = self.db.get(&rtxn, key.as_bytes())? else {
            return Ok(None);
        };

        tracing::trace!(key, len = bytes.len(), "fetched");
        Ok(Some(bytes.to_vec()))
    }

    /// Delete the value under `key`. Returns `false` if nothing was stored.
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn delete_bytes(&self, key: &str) -> heed::Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let deleted = self.db.delete(&mut wtxn, key.as_bytes())?;
        wtxn.commit()?;

        if deleted {
            tracing::trace!(key, "deleted");
        }
        Ok(deleted)
    }

    /// Record keys stored for `collection`, in key order. Feed the result to
    /// [`pebble_vault::Vault::restore`] after a restart.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn record_keys(&self, collection: &str) -> heed::Result<Vec<String>> {
        let prefix = SinkKey::collection_prefix(collection);
        let rtxn = self.env.read_txn()?;

        let mut keys = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, prefix.as_bytes())? {
            let (raw, _) = entry?;
            let Ok(raw) = std::str::from_utf8(raw) else {
                tracing::warn!(collection, "skipping non-utf8 sink key");
                continue;
            };
            if let Some(key) = SinkKey::decode(raw) {
                keys.push(key.key().to_string());
            }
        }
        Ok(keys)
    }

    /// Number of stored values.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn len(&self) -> heed::Result<u64> {
        let rtxn = self.env.read_txn()?;
        self.db.len(&rtxn)
    }

    /// Check if nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn is_empty(&self) -> heed::Result<bool> {
        let rtxn = self.env.read_txn()?;
        self.db.is_empty(&rtxn)
    }

    /// Flush the environment to disk.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> heed::Result<()> {
        self.env.force_sync()
    }
}

fn backend(e: &heed::Error) -> SinkError {
    SinkError::Backend(e.to_string())
}

impl DurableSink for LmdbSink {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), SinkError> {
        self.put_bytes(key, value).map_err(|e| backend(&e))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, SinkError> {
        self.get_bytes(key)
            .map_err(|e| backend(&e))?
            .ok_or(SinkError::NotFound)
    }

    fn delete(&self, key: &str) -> Result<(), SinkError> {
        if self.delete_bytes(key).map_err(|e| backend(&e))? {
            Ok(())
        } else {
            Err(SinkError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LmdbSink::open(dir.path()).unwrap();

        let key = SinkKey::new("fleet", "ship-1").encode();
        sink.put(&key, b"hello").unwrap();
        assert_eq!(sink.get(&key).unwrap(), b"hello");

        sink.put(&key, b"again").unwrap();
        assert_eq!(sink.get(&key).unwrap(), b"again");
        assert_eq!(sink.len().unwrap(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LmdbSink::open(dir.path()).unwrap();

        assert!(matches!(sink.get("missing"), Err(SinkError::NotFound)));
        assert_eq!(sink.get_bytes("missing").unwrap(), None);
        assert!(sink.is_empty().unwrap());
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LmdbSink::open(dir.path()).unwrap();

        sink.put("k", b"v").unwrap();
        sink.delete("k").unwrap();
        assert!(matches!(sink.get("k"), Err(SinkError::NotFound)));
        assert!(matches!(sink.delete("k"), Err(SinkError::NotFound)));
    }

    #[test]
    fn test_record_keys_are_scoped_to_collection() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LmdbSink::open(dir.path()).unwrap();

        for (collection, key) in [
            ("fleet", "ship-2"),
            ("fleet", "ship-1"),
            ("fleet2", "ship-9"),
            ("dock", "fleet/ship-3"),
        ] {
            sink.put(&SinkKey::new(collection, key).encode(), b"").unwrap();
        }

        assert_eq!(sink.record_keys("fleet").unwrap(), ["ship-1", "ship-2"]);
        assert_eq!(sink.record_keys("dock").unwrap(), ["fleet/ship-3"]);
        assert!(sink.record_keys("cargo").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sink = LmdbSink::open(dir.path()).unwrap();
            sink.put("k", b"durable").unwrap();
            sink.sync().unwrap();
        }

        let sink = LmdbSink::open(dir.path()).unwrap();
        assert_eq!(sink.get("k").unwrap(), b"durable");
    }
}
