//! Quick Write Tests
//!
//! The record-free fast path: one native atomic call for small op sets,
//! healing plus one retry on foreign locks, and the transaction-envelope
//! fallback for everything else.

use crate::common::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fast Path
// ============================================================================

#[tokio::test]
async fn a_ten_item_write_costs_one_native_call() {
    init_tracing();
    let counting = Arc::new(CountingStore::new(MemoryStore::new()));
    provision(counting.inner(), &EngineConfig::default());
    let txns = TxCoordinator::new(counting.clone());

    let puts: Vec<ItemRequest> = (0..10i64)
        .map(|i| ItemRequest::Put {
            table: "items".into(),
            item: item(&format!("w{}", i), i),
        })
        .collect();
    txns.write_atomic(puts).await.unwrap();

    assert_eq!(counting.atomic_writes(), 1);
    assert_eq!(counting.single_writes(), 0);
    assert_eq!(
        counting.inner().row_count("transactions").unwrap(),
        0,
        "the fast path writes no transaction record"
    );
    for i in 0..10i64 {
        let row = counting
            .inner()
            .get_item(&key(&format!("w{}", i)), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("n").and_then(AttrValue::as_int), Some(i));
        assert!(!lock_state(&row).is_locked());
    }
    assert_eq!(txns.stats().quick_writes, 1);
}

#[tokio::test]
async fn a_live_lock_cancels_the_quick_write() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let t1 = bed.txns.begin().await.unwrap();
    t1.update(key("a"), set_n(5)).await.unwrap();

    let err = bed
        .txns
        .write_atomic(vec![ItemRequest::Update {
            key: key("a"),
            ops: set_n(7),
        }])
        .await
        .unwrap_err();
    match err {
        TxError::Conflict { conflicts } => {
            assert_eq!(&conflicts[0].owner, t1.id());
        }
        other => panic!("expected a lock conflict, got {:?}", other),
    }

    // The holder was not disturbed.
    assert_eq!(bed.n_of("a").await, Some(5));
    t1.commit().await.unwrap();
    assert_eq!(bed.n_of("a").await, Some(5));
}

#[tokio::test]
async fn a_canceled_quick_write_retries_exactly_once() {
    init_tracing();
    let counting = Arc::new(CountingStore::new(MemoryStore::new()));
    let config = EngineConfig::default().with_staleness(Duration::from_secs(3600));
    provision(counting.inner(), &config);
    let txns = TxCoordinator::with_config(counting.clone(), config);

    counting
        .inner()
        .put_item("items", item("a", 1), Condition::none())
        .await
        .unwrap();

    let t1 = txns.begin().await.unwrap();
    t1.update(key("a"), set_n(5)).await.unwrap();

    let err = txns
        .write_atomic(vec![ItemRequest::Update {
            key: key("a"),
            ops: set_n(7),
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::Conflict { .. }));
    assert_eq!(
        counting.atomic_writes(),
        2,
        "one initial attempt plus one post-healing retry, never more"
    );

    t1.rollback().await.unwrap();
}

#[tokio::test]
async fn a_stale_lock_is_healed_then_the_write_lands() {
    let bed = TestBed::with_config(EngineConfig::default().with_staleness(Duration::ZERO));
    bed.seed("a", 1).await;

    let t1 = bed.txns.begin().await.unwrap();
    t1.update(key("a"), set_n(5)).await.unwrap();
    let abandoned = t1.id().clone();

    bed.txns
        .write_atomic(vec![ItemRequest::Update {
            key: key("a"),
            ops: set_n(7),
        }])
        .await
        .unwrap();

    assert_eq!(bed.n_of("a").await, Some(7));
    bed.assert_unlocked("a").await;
    assert_eq!(
        bed.txns.status(&abandoned).await.unwrap(),
        TxState::RolledBack
    );
    let stats = bed.txns.stats();
    assert_eq!(stats.quick_writes, 1);
    assert!(stats.conflicts_healed >= 1);
}

#[tokio::test]
async fn caller_conditions_surface_as_canceled_writes() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let err = bed
        .txns
        .write_atomic(vec![
            ItemRequest::ConditionCheck {
                key: key("a"),
                condition: Condition::attr_eq("n", 9i64),
            },
            ItemRequest::Put {
                table: "items".into(),
                item: item("b", 2),
            },
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TxError::Store(StoreError::WriteCanceled { .. })
    ));
    assert!(bed.raw("b").await.is_none());
}

// ============================================================================
// Fallback Envelope
// ============================================================================

#[tokio::test]
async fn an_oversized_set_falls_back_to_a_transaction() {
    let bed = TestBed::with_write_limit(3, EngineConfig::default());

    let puts: Vec<ItemRequest> = (0..5i64)
        .map(|i| ItemRequest::Put {
            table: "items".into(),
            item: item(&format!("k{}", i), i),
        })
        .collect();
    bed.txns.write_atomic(puts).await.unwrap();

    for i in 0..5i64 {
        let id = format!("k{}", i);
        assert_eq!(bed.n_of(&id).await, Some(i));
        bed.assert_unlocked(&id).await;
    }
    let records = bed.txns.records().list(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, TxState::Committed);
    assert_eq!(bed.txns.stats().quick_writes, 0);
}

#[tokio::test]
async fn the_fallback_rolls_back_when_it_cannot_finish() {
    let bed = TestBed::with_write_limit(
        3,
        EngineConfig::default().with_staleness(Duration::from_secs(3600)),
    );
    for i in 0..5 {
        bed.seed(&format!("k{}", i), 0).await;
    }

    let blocker = bed.txns.begin().await.unwrap();
    blocker.update(key("k4"), set_n(-1)).await.unwrap();

    let updates: Vec<ItemRequest> = (0..5i64)
        .map(|i| ItemRequest::Update {
            key: key(&format!("k{}", i)),
            ops: set_n(1),
        })
        .collect();
    let err = bed.txns.write_atomic(updates).await.unwrap_err();
    assert!(matches!(err, TxError::Conflict { .. }));

    for i in 0..4 {
        let id = format!("k{}", i);
        assert_eq!(bed.n_of(&id).await, Some(0), "{} must be restored", id);
        bed.assert_unlocked(&id).await;
    }

    let envelope = bed
        .txns
        .records()
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .find(|r| &r.id != blocker.id())
        .unwrap();
    assert_eq!(envelope.state, TxState::RolledBack);

    blocker.rollback().await.unwrap();
}

#[tokio::test]
async fn quick_writes_can_be_disabled() {
    init_tracing();
    let counting = Arc::new(CountingStore::new(MemoryStore::new()));
    let config = EngineConfig::default().with_quick_writes(false);
    provision(counting.inner(), &config);
    let txns = TxCoordinator::with_config(counting.clone(), config);

    txns.write_atomic(vec![ItemRequest::Put {
        table: "items".into(),
        item: item("x", 1),
    }])
    .await
    .unwrap();

    assert_eq!(counting.atomic_writes(), 0, "the fast path must be off");
    assert!(counting.single_writes() > 0);
    assert_eq!(counting.inner().row_count("transactions").unwrap(), 1);
    assert_eq!(txns.stats().quick_writes, 0);
    assert_eq!(txns.stats().completed(), 1);
}
