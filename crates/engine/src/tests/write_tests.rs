use super::helpers::{count_sst_files, open, test_config, wait_until};
use crate::*;
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

// --------------------- Basic put / get / delete ---------------------

#[test]
fn put_and_get() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("name", "alice")?;
    assert_eq!(engine.get("name")?, Some(b"alice".to_vec()));
    assert_eq!(engine.stats().last_seq, 1);
    Ok(())
}

#[test]
fn get_missing_key() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    assert_eq!(engine.get("nope")?, None);
    Ok(())
}

#[test]
fn empty_value_is_a_value() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("k", "")?;
    assert_eq!(engine.get("k")?, Some(Vec::new()));
    Ok(())
}

#[test]
fn overwrite_keeps_latest() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("k", "v1")?;
    engine.put("k", "v2")?;
    assert_eq!(engine.get("k")?, Some(b"v2".to_vec()));
    Ok(())
}

#[test]
fn delete_removes_key() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("k", "v")?;
    engine.delete("k")?;
    assert_eq!(engine.get("k")?, None);
    assert_eq!(engine.stats().last_seq, 2);
    Ok(())
}

#[test]
fn delete_hides_value_in_older_segment() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("k", "old")?;
    engine.flush()?;
    assert_eq!(count_sst_files(dir.path()), 1);

    engine.delete("k")?;
    assert_eq!(engine.get("k")?, None);

    // The tombstone keeps hiding it once it is on disk as well.
    engine.flush()?;
    assert_eq!(count_sst_files(dir.path()), 2);
    assert_eq!(engine.get("k")?, None);
    Ok(())
}

#[test]
fn put_delete_scenario() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("a", "1")?;
    engine.put("b", "2")?;
    engine.delete("a")?;

    assert_eq!(engine.get("a")?, None);
    assert_eq!(engine.get("b")?, Some(b"2".to_vec()));
    let range = engine.get_range("a", "z")?;
    assert_eq!(range.len(), 1);
    assert_eq!(range.get(b"b".as_slice()), Some(&b"2".to_vec()));
    Ok(())
}

// --------------------- Validation ---------------------

#[test]
fn invalid_keys_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    for bad in [&b""[..], b"   ", b"\t\n"] {
        assert!(matches!(engine.put(bad, "v"), Err(EngineError::InvalidKey(_))));
        assert!(matches!(engine.delete(bad), Err(EngineError::InvalidKey(_))));
        assert!(matches!(engine.get(bad), Err(EngineError::InvalidKey(_))));
    }

    let long = vec![b'x'; MAX_KEY_SIZE + 1];
    assert!(matches!(engine.put(&long, "v"), Err(EngineError::InvalidKey(_))));
    engine.put(&long[..MAX_KEY_SIZE], "v")?;

    // Nothing rejected consumed a sequence number.
    assert_eq!(engine.stats().last_seq, 1);
    Ok(())
}

#[test]
fn keys_are_trimmed() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put("  padded \t", "v")?;
    assert_eq!(engine.get("padded")?, Some(b"v".to_vec()));
    assert_eq!(engine.get(" padded ")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn oversized_value_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let big = vec![0u8; MAX_VALUE_SIZE + 1];
    assert!(matches!(engine.put("k", &big), Err(EngineError::InvalidValue(_))));
    assert_eq!(engine.get("k")?, None);
    Ok(())
}

// --------------------- Batches ---------------------

#[test]
fn put_batch_applies_in_order() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put_batch([("a", "1"), ("b", "2"), ("a", "3")])?;
    assert_eq!(engine.get("a")?, Some(b"3".to_vec()));
    assert_eq!(engine.get("b")?, Some(b"2".to_vec()));
    assert_eq!(engine.stats().last_seq, 3);
    Ok(())
}

#[test]
fn put_batch_with_invalid_key_writes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let result = engine.put_batch([("a", "1"), (" ", "2"), ("c", "3")]);
    assert!(matches!(result, Err(EngineError::InvalidKey(_))));
    assert_eq!(engine.get("a")?, None);
    assert_eq!(engine.stats().last_seq, 0);
    Ok(())
}

#[test]
fn empty_batch_is_ok() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    engine.put_batch(Vec::<(&str, &str)>::new())?;
    assert_eq!(engine.stats().last_seq, 0);
    Ok(())
}

#[test]
fn batch_partial_names_prefix_and_key() {
    let err = EngineError::BatchPartial {
        applied: 2,
        total: 5,
        key: "c".to_string(),
        source: Box::new(EngineError::io("put", Some(b"c"), anyhow::anyhow!("disk full"))),
    };
    let msg = err.to_string();
    assert!(msg.contains("2 of 5"), "{msg}");
    assert!(msg.contains("\"c\""), "{msg}");

    let source = std::error::Error::source(&err).map(ToString::to_string);
    assert_eq!(source.as_deref(), Some("put failed for key \"c\""));
}

#[test]
fn batch_failing_midway_keeps_only_the_prefix() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        engine.inner.faults.fail_appends_after(2);
        let err = engine
            .put_batch([("k0", "v0"), ("k1", "v1"), ("k2", "v2"), ("k3", "v3")])
            .unwrap_err();
        match &err {
            EngineError::BatchPartial {
                applied,
                total,
                key,
                ..
            } => assert_eq!((*applied, *total, key.as_str()), (2, 4, "k2")),
            other => panic!("expected a partial batch, got {other:?}"),
        }
        assert_eq!(engine.get("k0")?, Some(b"v0".to_vec()));
        assert_eq!(engine.get("k1")?, Some(b"v1".to_vec()));
        assert_eq!(engine.get("k2")?, None);
        assert_eq!(engine.get("k3")?, None);
        assert_eq!(engine.stats().last_seq, 2);
        engine.inner.faults.clear();
        engine.close()?;
    }

    // Only the committed prefix is in the WAL.
    let engine = open(dir.path())?;
    assert_eq!(engine.get("k1")?, Some(b"v1".to_vec()));
    assert_eq!(engine.get("k2")?, None);
    assert_eq!(engine.get("k3")?, None);
    engine.put("k2", "later")?;
    assert_eq!(engine.stats().last_seq, 3);
    Ok(())
}

#[test]
fn queue_errors_map_to_backpressure() {
    assert!(EngineError::from(QueueError::Full).is_backpressure());
    assert!(EngineError::from(QueueError::Timeout).is_backpressure());
    assert!(matches!(EngineError::from(QueueError::Closed), EngineError::Closed));
    assert!(EngineError::WriteStall { frozen: 4 }.is_backpressure());
}

// --------------------- Lifecycle ---------------------

#[test]
fn operations_before_start_fail() -> Result<()> {
    let dir = tempdir()?;
    let engine = StorageEngine::new(test_config(dir.path()), Arc::new(NoopReplication))?;

    assert!(matches!(engine.put("k", "v"), Err(EngineError::NotStarted)));
    assert!(matches!(engine.get("k"), Err(EngineError::NotStarted)));
    assert!(matches!(engine.flush(), Err(EngineError::NotStarted)));
    // Nothing touches the disk before start.
    assert!(!dir.path().join(WAL_FILENAME).exists());

    engine.start()?;
    engine.start()?;
    engine.put("k", "v")?;
    assert_eq!(engine.get("k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn close_is_idempotent_and_final() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.put("k", "v")?;

    engine.close()?;
    engine.close()?;
    assert!(matches!(engine.put("k", "v2"), Err(EngineError::Closed)));
    assert!(matches!(engine.get("k"), Err(EngineError::Closed)));
    assert!(matches!(engine.compact(), Err(EngineError::Closed)));
    assert!(matches!(engine.start(), Err(EngineError::Closed)));
    Ok(())
}

#[test]
fn invalid_config_rejected() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path()).compaction_fan_in(1);
    let result = StorageEngine::new(config, Arc::new(NoopReplication));
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[test]
fn close_drains_queued_writes() -> Result<()> {
    let dir = tempdir()?;
    let engine = Arc::new(open(dir.path())?);

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..50 {
                    engine.put(format!("t{t}-{i:03}"), "v").unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    engine.close()?;

    let engine = open(dir.path())?;
    assert_eq!(engine.stats().last_seq, 200);
    assert_eq!(engine.get_range("t0", "t9")?.len(), 200);
    Ok(())
}

// --------------------- Memtable threshold ---------------------

#[test]
fn threshold_freezes_and_flushes_in_background() -> Result<()> {
    let dir = tempdir()?;
    let engine = StorageEngine::open(test_config(dir.path()).memtable_flush_bytes(512))?;

    for i in 0..100 {
        engine.put(format!("key{i:03}"), format!("value{i:03}"))?;
    }

    assert!(wait_until(Duration::from_secs(5), || {
        let stats = engine.stats();
        stats.frozen_memtables == 0 && stats.segment_count() > 0
    }));
    assert!(count_sst_files(dir.path()) > 1);

    for i in 0..100 {
        assert_eq!(
            engine.get(format!("key{i:03}"))?,
            Some(format!("value{i:03}").into_bytes())
        );
    }
    Ok(())
}

#[test]
fn concurrent_writers_get_unique_sequence_numbers() -> Result<()> {
    let dir = tempdir()?;
    let engine = Arc::new(StorageEngine::open(
        test_config(dir.path())
            .fsync_policy(FsyncPolicy::Interval(Duration::from_millis(5)))
            .memtable_flush_bytes(4096),
    )?);

    let writers: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || -> Result<(), EngineError> {
                for i in 0..100 {
                    engine.put(format!("w{t}:{i}"), i.to_string())?;
                }
                Ok(())
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap()?;
    }

    assert_eq!(engine.stats().last_seq, 800);
    for t in 0..8 {
        for i in 0..100 {
            assert_eq!(engine.get(format!("w{t}:{i}"))?, Some(i.to_string().into_bytes()));
        }
    }
    Ok(())
}

#[test]
fn frozen_backlog_is_capped_and_writes_stall() -> Result<()> {
    let dir = tempdir()?;
    let engine = StorageEngine::open(
        test_config(dir.path())
            .memtable_flush_bytes(64)
            .max_frozen_memtables(2)
            .write_stall_timeout(Duration::from_millis(50)),
    )?;
    engine.inner.faults.fail_flushes(true);

    let mut stalled = None;
    for i in 0..50 {
        let key = format!("key{i:02}");
        if let Err(e) = engine.put(&key, "value-value-value") {
            stalled = Some((key, e));
            break;
        }
    }
    let (key, err) = stalled.expect("writes never stalled");
    assert!(matches!(err, EngineError::WriteStall { frozen: 2 }), "{err}");
    assert!(err.is_backpressure());
    assert_eq!(engine.get(&key)?, None);
    assert_eq!(engine.stats().frozen_memtables, 2);

    // Flushes work again: the backlog drains and writes resume.
    engine.inner.faults.clear();
    engine.flush()?;
    assert_eq!(engine.stats().frozen_memtables, 0);
    engine.put(&key, "after the stall")?;
    assert_eq!(engine.get(&key)?, Some(b"after the stall".to_vec()));
    assert_eq!(engine.get("key00")?, Some(b"value-value-value".to_vec()));
    Ok(())
}
