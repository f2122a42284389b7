//! Vault state survives a process restart through the LMDB sink.

use std::sync::Arc;

use pebble_lmdb::LmdbSink;
use pebble_vault::{ErrorKind, Point3, Vault};

fn open(path: &std::path::Path) -> (Arc<LmdbSink>, Vault) {
    let sink = Arc::new(LmdbSink::open(path).unwrap());
    let vault = Vault::builder().sink(sink.clone()).build();
    vault.create_collection("fleet", true).unwrap();
    (sink, vault)
}

#[test]
fn test_persisted_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let (_sink, vault) = open(dir.path());
        vault
            .insert("fleet", "ship-1", r#"{"faction": "red"}"#, Some(Point3::new(1.0, 0.0, 0.0)))
            .unwrap();
        vault
            .insert("fleet", "ship-2", r#"{"faction": "blue"}"#, Some(Point3::new(9.0, 0.0, 0.0)))
            .unwrap();
        vault.insert("fleet", "draft", "{}", None).unwrap();
        vault.patch("fleet", "ship-1", r#"{"hp": 3}"#).unwrap();

        vault.persist("fleet", "ship-1").unwrap();
        vault.persist("fleet", "ship-2").unwrap();
    }

    let (sink, vault) = open(dir.path());
    let keys = sink.record_keys("fleet").unwrap();
    assert_eq!(keys, ["ship-1", "ship-2"]);

    let restored = vault.restore("fleet", &keys).unwrap();
    assert!(restored.iter().all(Result::is_ok));

    let ship = vault.read("fleet", "ship-1").unwrap();
    assert_eq!(ship.version, 2);
    assert!(!ship.dirty);
    let doc: serde_json::Value = serde_json::from_slice(&ship.payload).unwrap();
    assert_eq!(doc, serde_json::json!({"faction": "red", "hp": 3}));

    assert_eq!(vault.nearest("fleet", Point3::ORIGIN, 1).unwrap()[0].key, "ship-1");
    assert_eq!(vault.read("fleet", "draft").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_evict_load_purge() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, vault) = open(dir.path());

    vault.insert("fleet", "ship-1", "{}", Some(Point3::ORIGIN)).unwrap();
    vault.persist("fleet", "ship-1").unwrap();
    vault.evict("fleet", "ship-1").unwrap();
    assert_eq!(sink.len().unwrap(), 1);

    let loaded = vault.load("fleet", "ship-1").unwrap();
    assert_eq!(loaded.position, Some(Point3::ORIGIN));

    vault.purge("fleet", "ship-1").unwrap();
    assert!(sink.is_empty().unwrap());
    assert_eq!(vault.purge("fleet", "ship-1").unwrap_err().kind(), ErrorKind::NotFound);
}
