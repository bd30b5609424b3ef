//! End-to-end transaction engine scenarios: contention and wake-up, deadlock
//! detection, savepoints, commit ordering, and redo-log recovery.

use amber::{
    AmberError, EngineConfig, Key, MemoryStorage, RedoLogRecord, SyncMode, TransactionEngine,
    TransactionStatus, TransactionalValue, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

type CellStorage = MemoryStorage<Arc<TransactionalValue>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn in_memory_engine() -> Arc<TransactionEngine> {
    TransactionEngine::new(EngineConfig::default()).unwrap()
}

#[test]
fn test_waiter_acquires_lock_after_holder_commits() {
    let engine = in_memory_engine();
    let storage = Arc::new(CellStorage::new());

    let t1 = engine.begin_transaction();
    let m1 = t1.open_map("t", storage.as_ref()).unwrap();
    m1.put(Key::from("x"), Value::from(1)).unwrap();

    let blocked = Arc::new(AtomicBool::new(false));
    let handle = {
        let engine = engine.clone();
        let storage = storage.clone();
        let blocked = blocked.clone();
        std::thread::spawn(move || {
            let t2 = engine.begin_transaction();
            let m2 = t2.open_map("t", storage.as_ref()).unwrap();
            blocked.store(true, Ordering::SeqCst);
            m2.put(Key::from("x"), Value::from(2)).unwrap();
            t2.commit().unwrap();
        })
    };

    // Let the waiter enqueue, then release by committing.
    while !blocked.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    std::thread::sleep(Duration::from_millis(50));
    t1.commit().unwrap();
    handle.join().unwrap();

    let reader = engine.begin_transaction();
    let map = reader.open_map("t", storage.as_ref()).unwrap();
    assert_eq!(map.get(&Key::from("x")).unwrap(), Some(Value::from(2)));
}

#[test]
fn test_waiter_acquires_lock_after_holder_rollback() {
    let engine = in_memory_engine();
    let storage = Arc::new(CellStorage::new());

    let t0 = engine.begin_transaction();
    let m0 = t0.open_map("t", storage.as_ref()).unwrap();
    m0.put(Key::from("x"), Value::from(1)).unwrap();
    t0.commit().unwrap();

    let t1 = engine.begin_transaction();
    let m1 = t1.open_map("t", storage.as_ref()).unwrap();
    m1.put(Key::from("x"), Value::from(99)).unwrap();

    let handle = {
        let engine = engine.clone();
        let storage = storage.clone();
        std::thread::spawn(move || {
            let t2 = engine.begin_transaction();
            let m2 = t2.open_map("t", storage.as_ref()).unwrap();
            let before = m2.get(&Key::from("x")).unwrap();
            m2.put(Key::from("x"), Value::from(2)).unwrap();
            t2.commit().unwrap();
            before
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    t1.rollback().unwrap();
    let before = handle.join().unwrap();

    // The rolled-back write was never visible to the waiter.
    assert_eq!(before, Some(Value::from(1)));
    let reader = engine.begin_transaction();
    let map = reader.open_map("t", storage.as_ref()).unwrap();
    assert_eq!(map.get(&Key::from("x")).unwrap(), Some(Value::from(2)));
}

#[test]
fn test_serialized_increments_lose_no_updates() {
    let engine = in_memory_engine();
    let storage = Arc::new(CellStorage::new());

    {
        let setup = engine.begin_transaction();
        let map = setup.open_map("counters", storage.as_ref()).unwrap();
        map.put(Key::from("n"), Value::from(0)).unwrap();
        setup.commit().unwrap();
    }

    let threads = 4;
    let per_thread = 10;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();
    for _ in 0..threads {
        let engine = engine.clone();
        let storage = storage.clone();
        let barrier = barrier.clone();
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            for _ in 0..per_thread {
                let txn = engine.begin_transaction();
                txn.set_lock_timeout(Duration::from_secs(10));
                let map = txn.open_map("counters", storage.as_ref()).unwrap();
                // Lock before reading so the read-modify-write serializes.
                let cell = map.lock_exclusive(&Key::from("n")).unwrap();
                let current = match cell.read_for(txn.id()) {
                    Some(Value::I64(n)) => n,
                    other => panic!("unexpected counter value: {:?}", other),
                };
                map.put(Key::from("n"), Value::from(current + 1)).unwrap();
                txn.commit().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let reader = engine.begin_transaction();
    let map = reader.open_map("counters", storage.as_ref()).unwrap();
    assert_eq!(
        map.get(&Key::from("n")).unwrap(),
        Some(Value::from((threads * per_thread) as i64))
    );
}

#[test]
fn test_mutual_wait_is_reported_as_deadlock() {
    let engine = in_memory_engine();
    let storage = Arc::new(CellStorage::new());

    let t1 = engine.begin_transaction();
    t1.set_lock_timeout(Duration::from_millis(100));
    let m1 = t1.open_map("t", storage.as_ref()).unwrap();
    m1.put(Key::from("a"), Value::from(1)).unwrap();

    let t2 = engine.begin_transaction();
    t2.set_lock_timeout(Duration::from_secs(10));
    let m2 = t2.open_map("t", storage.as_ref()).unwrap();
    m2.put(Key::from("b"), Value::from(2)).unwrap();

    // t2 blocks on "a" in the background; t1 then blocks on "b".
    let handle = {
        let t2 = t2.clone();
        let storage = storage.clone();
        std::thread::spawn(move || {
            let m2 = t2.open_map("t", storage.as_ref()).unwrap();
            m2.put(Key::from("a"), Value::from(2))
        })
    };
    while t2.status() != TransactionStatus::Waiting {
        std::thread::yield_now();
    }

    let err = m1.put(Key::from("b"), Value::from(1)).unwrap_err();
    match err {
        AmberError::Deadlock {
            waiter_key,
            holder_key,
            ..
        } => {
            assert_eq!(waiter_key, Key::from("b"));
            assert_eq!(holder_key, Key::from("a"));
        }
        other => panic!("expected deadlock, got {other}"),
    }

    // Breaking the cycle lets the other side finish.
    t1.rollback().unwrap();
    handle.join().unwrap().unwrap();
    t2.commit().unwrap();

    let reader = engine.begin_transaction();
    let map = reader.open_map("t", storage.as_ref()).unwrap();
    assert_eq!(map.get(&Key::from("a")).unwrap(), Some(Value::from(2)));
    assert_eq!(map.get(&Key::from("b")).unwrap(), Some(Value::from(2)));
}

#[test]
fn test_three_party_cycle_falls_back_to_lock_timeout() {
    let engine = in_memory_engine();
    let storage = Arc::new(CellStorage::new());

    let t1 = engine.begin_transaction();
    t1.set_lock_timeout(Duration::from_millis(100));
    let t2 = engine.begin_transaction();
    t2.set_lock_timeout(Duration::from_millis(400));
    let t3 = engine.begin_transaction();
    t3.set_lock_timeout(Duration::from_millis(400));

    let m1 = t1.open_map("t", storage.as_ref()).unwrap();
    m1.put(Key::from("a"), Value::from(1)).unwrap();
    let m2 = t2.open_map("t", storage.as_ref()).unwrap();
    m2.put(Key::from("b"), Value::from(2)).unwrap();
    let m3 = t3.open_map("t", storage.as_ref()).unwrap();
    m3.put(Key::from("c"), Value::from(3)).unwrap();

    // t2 -> a, t3 -> b in the background; t1 -> c closes the 3-cycle.
    let h2 = {
        let t2 = t2.clone();
        let storage = storage.clone();
        std::thread::spawn(move || {
            let m = t2.open_map("t", storage.as_ref()).unwrap();
            m.put(Key::from("a"), Value::from(20))
        })
    };
    while t2.status() != TransactionStatus::Waiting {
        std::thread::yield_now();
    }
    let h3 = {
        let t3 = t3.clone();
        let storage = storage.clone();
        std::thread::spawn(move || {
            let m = t3.open_map("t", storage.as_ref()).unwrap();
            m.put(Key::from("b"), Value::from(30))
        })
    };
    while t3.status() != TransactionStatus::Waiting {
        std::thread::yield_now();
    }

    // The two-hop check cannot see the full cycle, so this is a timeout.
    let err = m1.put(Key::from("c"), Value::from(10)).unwrap_err();
    assert!(matches!(err, AmberError::LockTimeout { .. }), "{err}");

    t1.rollback().unwrap();
    let _ = h2.join().unwrap();
    let _ = h3.join().unwrap();
    for txn in [t2, t3] {
        if !txn.is_closed() {
            txn.rollback().unwrap();
        }
    }
}

#[test]
fn test_named_savepoints_discard_by_position() {
    let engine = in_memory_engine();
    let storage = CellStorage::new();

    let txn = engine.begin_transaction();
    let map = txn.open_map("t", &storage).unwrap();
    map.put(Key::from("a"), Value::from(1)).unwrap();
    txn.add_savepoint("sp1").unwrap();
    map.put(Key::from("b"), Value::from(2)).unwrap();
    txn.add_savepoint("sp2").unwrap();
    map.put(Key::from("c"), Value::from(3)).unwrap();

    txn.rollback_to_savepoint("sp1").unwrap();
    assert_eq!(map.get(&Key::from("a")).unwrap(), Some(Value::from(1)));
    assert_eq!(map.get(&Key::from("b")).unwrap(), None);
    assert_eq!(map.get(&Key::from("c")).unwrap(), None);

    // Positions at or beyond the target are gone, the target included.
    assert!(matches!(
        txn.rollback_to_savepoint("sp2"),
        Err(AmberError::SavepointInvalid { .. })
    ));
    assert!(matches!(
        txn.rollback_to_savepoint("sp1"),
        Err(AmberError::SavepointInvalid { .. })
    ));

    txn.commit().unwrap();
    let reader = engine.begin_transaction();
    let map = reader.open_map("t", &storage).unwrap();
    assert_eq!(map.get(&Key::from("a")).unwrap(), Some(Value::from(1)));
    assert_eq!(map.get(&Key::from("b")).unwrap(), None);
}

#[test]
fn test_savepoint_id_roundtrip() {
    let engine = in_memory_engine();
    let storage = CellStorage::new();

    let txn = engine.begin_transaction();
    let map = txn.open_map("t", &storage).unwrap();
    map.put(Key::from("a"), Value::from(1)).unwrap();
    let mark = txn.savepoint_id();
    map.put(Key::from("a"), Value::from(2)).unwrap();
    map.put(Key::from("b"), Value::from(3)).unwrap();

    txn.rollback_to_savepoint_id(mark).unwrap();
    assert_eq!(map.get(&Key::from("a")).unwrap(), Some(Value::from(1)));
    assert_eq!(map.get(&Key::from("b")).unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn test_commit_timestamps_are_even_and_monotonic() {
    let engine = in_memory_engine();
    let storage = CellStorage::new();

    let mut timestamps = Vec::new();
    for i in 0..5i64 {
        let txn = engine.begin_transaction();
        assert_eq!(txn.id() % 2, 1);
        let map = txn.open_map("t", &storage).unwrap();
        map.put(Key::from(format!("k{i}")), Value::from(i)).unwrap();
        txn.commit().unwrap();
        timestamps.push(txn.commit_timestamp().unwrap());
    }
    assert!(timestamps.iter().all(|ts| ts % 2 == 0));
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_rollback_leaves_no_commit_timestamp() {
    let engine = in_memory_engine();
    let storage = CellStorage::new();
    let txn = engine.begin_transaction();
    let map = txn.open_map("t", &storage).unwrap();
    map.put(Key::from("a"), Value::from(1)).unwrap();
    txn.rollback().unwrap();
    assert!(txn.commit_timestamp().is_none());
    assert!(txn.is_closed());
    assert!(matches!(txn.rollback(), Err(AmberError::TransactionClosed)));
}

#[test]
fn test_async_commit_runs_callback_and_publishes() {
    let dir = TempDir::new().unwrap();
    let engine = TransactionEngine::new(EngineConfig::durable(
        dir.path().join("redo.log"),
        SyncMode::Instant,
    ))
    .unwrap();
    let storage = CellStorage::new();

    let txn = engine.begin_transaction();
    let map = txn.open_map("t", &storage).unwrap();
    map.put(Key::from("a"), Value::from(1)).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();
    txn.async_commit(Some(Box::new(move || {
        done_clone.store(true, Ordering::SeqCst);
    })))
    .unwrap();

    for _ in 0..200 {
        if done.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(done.load(Ordering::SeqCst));
    assert!(txn.is_closed());

    let reader = engine.begin_transaction();
    let map = reader.open_map("t", &storage).unwrap();
    assert_eq!(map.get(&Key::from("a")).unwrap(), Some(Value::from(1)));
    engine.close();
}

#[test]
fn test_async_commit_callback_survives_external_finalize() {
    let dir = TempDir::new().unwrap();
    let engine = TransactionEngine::new(EngineConfig::durable(
        dir.path().join("redo.log"),
        SyncMode::Instant,
    ))
    .unwrap();
    let storage = CellStorage::new();

    let txn = engine.begin_transaction();
    let map = txn.open_map("t", &storage).unwrap();
    map.put(Key::from("a"), Value::from(1)).unwrap();

    // Park the sync thread inside a filler completion so the real redo
    // record stays queued while the finalize race is staged.
    let parked = Arc::new(AtomicBool::new(false));
    let parked_clone = parked.clone();
    engine.log_sync().async_commit(
        RedoLogRecord::new(txn.id(), Vec::new()),
        Box::new(move |_| {
            parked_clone.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
        }),
    );
    while !parked.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();
    txn.async_commit(Some(Box::new(move || {
        done_clone.store(true, Ordering::SeqCst);
    })))
    .unwrap();

    // A coordinator finalizes before the flush lands; the registry entry
    // is gone by the time the sync thread gets to the record.
    engine.commit_final(txn.id());
    assert!(txn.is_closed());

    // The completion must still run the callback.
    for _ in 0..400 {
        if done.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(done.load(Ordering::SeqCst));
    engine.close();
}

#[test]
fn test_redo_replay_restores_durable_maps() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("redo.log");

    {
        let engine =
            TransactionEngine::new(EngineConfig::durable(&path, SyncMode::Instant)).unwrap();
        let storage = CellStorage::durable();

        let t1 = engine.begin_transaction();
        let map = t1.open_map("accounts", &storage).unwrap();
        map.put(Key::from("alice"), Value::from(100)).unwrap();
        map.put(Key::from("bob"), Value::from(50)).unwrap();
        t1.commit().unwrap();

        let t2 = engine.begin_transaction();
        let map = t2.open_map("accounts", &storage).unwrap();
        map.remove(Key::from("bob")).unwrap();
        map.put(Key::from("carol"), Value::from(25)).unwrap();
        t2.commit().unwrap();

        // Rolled-back work must not be replayed later.
        let t3 = engine.begin_transaction();
        let map = t3.open_map("accounts", &storage).unwrap();
        map.put(Key::from("alice"), Value::from(0)).unwrap();
        t3.rollback().unwrap();

        engine.close();
    }

    // Fresh engine, fresh (empty) durable storage: replay rebuilds state.
    let engine = TransactionEngine::new(EngineConfig::durable(&path, SyncMode::Instant)).unwrap();
    let storage = CellStorage::durable();
    let txn = engine.begin_transaction();
    let map = txn.open_map("accounts", &storage).unwrap();
    assert_eq!(map.get(&Key::from("alice")).unwrap(), Some(Value::from(100)));
    assert_eq!(map.get(&Key::from("bob")).unwrap(), None);
    assert_eq!(map.get(&Key::from("carol")).unwrap(), Some(Value::from(25)));
    engine.close();
}

#[test]
fn test_read_only_commit_writes_no_redo_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("redo.log");

    {
        let engine =
            TransactionEngine::new(EngineConfig::durable(&path, SyncMode::Instant)).unwrap();
        let storage = CellStorage::durable();
        let txn = engine.begin_transaction();
        let map = txn.open_map("t", &storage).unwrap();
        assert_eq!(map.get(&Key::from("a")).unwrap(), None);
        txn.commit().unwrap();
        engine.close();
    }

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}
