// Concurrency boundary scenarios: deadlock victim selection and lost-update
// prevention under contended atomic increments.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use docudb::{DbError, Engine, EngineConfig, EngineEvent, Value};

fn data(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_deadlock_names_younger_transaction_as_victim() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(EngineConfig::new(dir.path())).unwrap());
    engine
        .insert_one("c", "r1", data(&[("n", Value::Int(0))]))
        .await
        .unwrap();
    engine
        .insert_one("c", "r2", data(&[("n", Value::Int(0))]))
        .await
        .unwrap();

    let mut events = engine.subscribe();

    // A begins first, B second: B is the younger transaction.
    let txn_a = engine.begin().unwrap();
    let txn_b = engine.begin().unwrap();
    assert!(txn_a < txn_b);

    // A takes X(r1); B takes X(r2).
    engine
        .update(&txn_a, "c", "r1", data(&[("n", Value::Int(1))]))
        .await
        .unwrap();
    engine
        .update(&txn_b, "c", "r2", data(&[("n", Value::Int(2))]))
        .await
        .unwrap();

    // A requests X(r2) and blocks behind B.
    let blocked = {
        let engine = Arc::clone(&engine);
        let txn_a = txn_a.clone();
        tokio::spawn(async move {
            engine
                .update(&txn_a, "c", "r2", data(&[("n", Value::Int(3))]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B requesting X(r1) closes the cycle and fails with the distinguished
    // error naming it as the victim.
    let err = engine
        .update(&txn_b, "c", "r1", data(&[("n", Value::Int(4))]))
        .await
        .unwrap_err();
    match &err {
        DbError::DeadlockDetected { victim, resource } => {
            assert_eq!(victim, &txn_b);
            assert_eq!(resource, "c:r1");
        }
        other => panic!("expected DeadlockDetected, got {other:?}"),
    }

    // The deadlock event names the victim and the participants.
    let mut saw_deadlock_event = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::DeadlockDetected { victim, participants } = event {
            assert_eq!(victim, txn_b);
            assert!(participants.contains(&txn_a));
            saw_deadlock_event = true;
        }
    }
    assert!(saw_deadlock_event, "deadlock event must be published");

    // B aborts; its r2 write is undone and its locks are gone, so A's
    // blocked request is granted and A commits.
    engine.abort(&txn_b, "deadlock victim").unwrap();
    blocked.await.unwrap().unwrap();
    engine.commit(&txn_a).unwrap();

    let r2 = engine.get_one("c", "r2").unwrap();
    assert_eq!(r2.get("n").unwrap(), Some(&Value::Int(3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_hundred_concurrent_increments_lose_nothing() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(Engine::open(EngineConfig::new(dir.path())).unwrap());
    engine
        .insert_one("c", "counter", data(&[("n", Value::Int(0))]))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .increment_one("c", "counter", "n", Value::Int(1))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let doc = engine.get_one("c", "counter").unwrap();
    assert_eq!(doc.get("n").unwrap(), Some(&Value::Int(100)));
    // One insert plus one version bump per committed increment.
    assert_eq!(doc.version, 101);
}

#[tokio::test]
async fn test_transaction_timeout_is_aborted_by_sweeper() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.txn_timeout = Some(Duration::from_millis(50));
    config.txn_sweep_interval = Duration::from_millis(50);
    let engine = Engine::open(config).unwrap();

    let mut events = engine.subscribe();
    let txn = engine.begin().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(engine.transaction_info(&txn).is_none(), "swept away");
    let mut saw_abort = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TransactionAborted { txn_id, reason } = event {
            assert_eq!(txn_id, txn);
            assert_eq!(reason, "Transaction timed out.");
            saw_abort = true;
        }
    }
    assert!(saw_abort);
}
