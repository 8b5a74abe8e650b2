//! Transaction Lifecycle Tests
//!
//! Begin through commit or rollback over the public API:
//! - every op kind applied and undone
//! - terminal-state semantics
//! - resuming and completing from another coordinator

use crate::common::*;
use std::sync::Arc;

// ============================================================================
// Commit
// ============================================================================

#[tokio::test]
async fn commit_applies_puts_updates_and_deletes() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;
    bed.seed("c", 3).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    let old = tx.delete(key("c")).await.unwrap();
    assert_eq!(old.and_then(|i| i.get("n").and_then(AttrValue::as_int)), Some(3));
    let id = tx.id().clone();
    tx.commit().await.unwrap();

    assert_eq!(bed.n_of("a").await, Some(9));
    assert_eq!(bed.n_of("b").await, Some(2));
    assert!(bed.raw("c").await.is_none());
    for id in ["a", "b"] {
        bed.assert_unlocked(id).await;
    }
    assert_eq!(bed.txns.status(&id).await.unwrap(), TxState::Committed);
}

#[tokio::test]
async fn empty_transaction_commits() {
    let bed = TestBed::new();
    let tx = bed.txns.begin().await.unwrap();
    let id = tx.id().clone();
    tx.commit().await.unwrap();
    assert_eq!(bed.txns.status(&id).await.unwrap(), TxState::Committed);
}

#[tokio::test]
async fn commit_purges_before_images() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(2)).await.unwrap();
    assert_eq!(bed.images(), 1);

    tx.commit().await.unwrap();
    assert_eq!(bed.images(), 0);
}

#[tokio::test]
async fn status_tracks_the_lifecycle() {
    let bed = TestBed::new();
    let tx = bed.txns.begin().await.unwrap();
    let id = tx.id().clone();
    assert_eq!(bed.txns.status(&id).await.unwrap(), TxState::Active);
    tx.commit().await.unwrap();
    assert_eq!(bed.txns.status(&id).await.unwrap(), TxState::Committed);
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn rollback_undoes_every_kind_of_write() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;
    bed.seed("c", 3).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();
    tx.delete(key("c")).await.unwrap();
    let id = tx.id().clone();
    tx.rollback().await.unwrap();

    assert_eq!(bed.n_of("a").await, Some(1));
    assert!(bed.raw("b").await.is_none(), "transient put must vanish");
    assert_eq!(bed.n_of("c").await, Some(3), "deferred delete must not run");
    for id in ["a", "c"] {
        bed.assert_unlocked(id).await;
    }
    assert_eq!(bed.txns.status(&id).await.unwrap(), TxState::RolledBack);
    assert_eq!(bed.images(), 0);
}

#[tokio::test]
async fn a_failed_check_leaves_the_transaction_rollbackable() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    let err = tx
        .check(key("a"), Condition::attr_eq("n", 99i64))
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::Validation(_)));

    // The item stays locked until the caller resolves the transaction.
    let raw = bed.raw("a").await.unwrap();
    assert!(lock_state(&raw).is_locked());

    tx.rollback().await.unwrap();
    assert_eq!(bed.n_of("a").await, Some(1));
    bed.assert_unlocked("a").await;
}

// ============================================================================
// Terminal States
// ============================================================================

#[tokio::test]
async fn finished_transactions_reject_new_work() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    let id = tx.id().clone();
    tx.commit().await.unwrap();
    let err = bed
        .txns
        .execute(&id, vec![ItemRequest::Update { key: key("a"), ops: set_n(5) }])
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::AlreadyCommitted(_)));

    let tx = bed.txns.begin().await.unwrap();
    let id = tx.id().clone();
    tx.rollback().await.unwrap();
    let err = bed
        .txns
        .execute(&id, vec![ItemRequest::Update { key: key("a"), ops: set_n(5) }])
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::AlreadyRolledBack(_)));
}

#[tokio::test]
async fn terminal_calls_are_idempotent_and_exclusive() {
    let bed = TestBed::new();

    let tx = bed.txns.begin().await.unwrap();
    let committed = tx.id().clone();
    tx.commit().await.unwrap();
    bed.txns.commit(&committed).await.unwrap();
    assert!(matches!(
        bed.txns.rollback(&committed).await,
        Err(TxError::AlreadyCommitted(_))
    ));

    let tx = bed.txns.begin().await.unwrap();
    let rolled = tx.id().clone();
    tx.rollback().await.unwrap();
    bed.txns.rollback(&rolled).await.unwrap();
    assert!(matches!(
        bed.txns.commit(&rolled).await,
        Err(TxError::AlreadyRolledBack(_))
    ));
}

// ============================================================================
// Reads Inside a Transaction
// ============================================================================

#[tokio::test]
async fn reads_inside_a_transaction_see_its_own_writes() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    let before = tx.get(key("a")).await.unwrap().unwrap();
    assert_eq!(before.get("n").and_then(AttrValue::as_int), Some(1));

    tx.update(key("a"), set_n(7)).await.unwrap();
    let after = tx.get(key("a")).await.unwrap().unwrap();
    assert_eq!(after.get("n").and_then(AttrValue::as_int), Some(7));

    tx.rollback().await.unwrap();
    assert_eq!(bed.n_of("a").await, Some(1));
}

#[tokio::test]
async fn reading_a_missing_item_returns_none() {
    let bed = TestBed::new();
    let tx = bed.txns.begin().await.unwrap();
    assert!(tx.get(key("ghost")).await.unwrap().is_none());
    tx.rollback().await.unwrap();
    // The read created a placeholder; rollback must remove it.
    assert!(bed.raw("ghost").await.is_none());
}

// ============================================================================
// Resume and Cross-Coordinator Completion
// ============================================================================

#[tokio::test]
async fn resume_continues_where_the_handle_left_off() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let id = {
        let tx = bed.txns.begin().await.unwrap();
        tx.update(key("a"), set_n(5)).await.unwrap();
        tx.id().clone()
    };

    let tx = bed.txns.resume(&id).await.unwrap();
    tx.update(key("b"), set_n(6)).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(bed.n_of("a").await, Some(5));
    assert_eq!(bed.n_of("b").await, Some(6));
}

#[tokio::test]
async fn resume_of_an_unknown_id_fails() {
    let bed = TestBed::new();
    let ghost = TxId::generate();
    assert!(matches!(
        bed.txns.resume(&ghost).await,
        Err(TxError::NotFound(_))
    ));
}

#[tokio::test]
async fn second_coordinator_completes_without_reapplying() {
    let bed = TestBed::new();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    let id = tx.id().clone();

    // Commit is decided, then this process "crashes". Another coordinator
    // instance, with an empty applied-request set, finishes the job.
    let record = bed.txns.records().get(&id, true).await.unwrap();
    bed.txns
        .records()
        .set_state(&record, TxState::Committing)
        .await
        .unwrap();

    let other = Arc::new(TxCoordinator::with_config(
        bed.store.clone(),
        EngineConfig::default(),
    ));
    other.commit(&id).await.unwrap();

    assert_eq!(bed.n_of("a").await, Some(9), "applied once, not twice");
    bed.assert_unlocked("a").await;
    assert_eq!(bed.txns.status(&id).await.unwrap(), TxState::Committed);
    assert_eq!(bed.images(), 0);
}
