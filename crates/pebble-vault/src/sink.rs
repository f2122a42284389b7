//! Durable sink contract and an in-memory implementation.

use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors a durable sink may report.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Nothing stored under the key.
    #[error("key not found in sink")]
    NotFound,

    /// The backend did not answer in time.
    #[error("sink timed out")]
    Timeout,

    /// Any other backend error.
    #[error("sink backend error: {0}")]
    Backend(String),
}

/// Narrow key-value contract for the durable store behind a vault.
///
/// Calls may block. The vault never invokes a sink while holding a
/// collection lock and never retries a failed call.
pub trait DurableSink: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns `Timeout` or `Backend` if the write did not happen.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), SinkError>;

    /// Fetch the value stored under `key`.
    ///
    /// # Errors
    /// Returns `NotFound` if nothing is stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>, SinkError>;

    /// Delete the value stored under `key`.
    ///
    /// # Errors
    /// Returns `NotFound` if nothing is stored under `key`.
    fn delete(&self, key: &str) -> Result<(), SinkError>;
}

/// Process-local sink backed by a hash map.
///
/// This is the default sink of a vault. It is useful for tests and for
/// hosts that only need the dirty tracking without durability.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the sink is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Check if a value is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// All stored keys starting with `prefix`, sorted.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_unstable();
        keys
    }
}

impl DurableSink for MemorySink {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), SinkError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, SinkError> {
        self.entries.lock().get(key).cloned().ok_or(SinkError::NotFound)
    }

    fn delete(&self, key: &str) -> Result<(), SinkError> {
        self.entries
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or(SinkError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let sink = MemorySink::new();
        sink.put("5:fleet/ship-1", b"abc").unwrap();
        assert_eq!(sink.get("5:fleet/ship-1").unwrap(), b"abc");

        sink.put("5:fleet/ship-1", b"xyz").unwrap();
        assert_eq!(sink.get("5:fleet/ship-1").unwrap(), b"xyz");
        assert_eq!(sink.len(), 1);

        sink.delete("5:fleet/ship-1").unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_missing_key() {
        let sink = MemorySink::new();
        assert!(matches!(sink.get("nope"), Err(SinkError::NotFound)));
        assert!(matches!(sink.delete("nope"), Err(SinkError::NotFound)));
    }

    #[test]
    fn test_prefix_listing() {
        let sink = MemorySink::new();
        sink.put("5:fleet/b", b"").unwrap();
        sink.put("5:fleet/a", b"").unwrap();
        sink.put("6:fleets/a", b"").unwrap();
        assert_eq!(sink.keys_with_prefix("5:fleet/"), ["5:fleet/a", "5:fleet/b"]);
    }
}
