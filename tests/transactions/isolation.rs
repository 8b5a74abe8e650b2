//! Read Isolation Tests
//!
//! The two read views around a transaction's lifecycle: uncommitted
//! (current values, whatever their state) and committed (last committed
//! values only).

use crate::common::*;

// ============================================================================
// Single-Item Reads
// ============================================================================

#[tokio::test]
async fn uncommitted_reads_see_applied_writes_immediately() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();

    let reader = bed.txns.reader(IsolationLevel::Uncommitted);
    let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
    assert_eq!(a.get("n").and_then(AttrValue::as_int), Some(9));
    let b = reader.get_item(&key("b"), true).await.unwrap().unwrap();
    assert_eq!(b.get("n").and_then(AttrValue::as_int), Some(2));

    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn committed_reads_hide_in_flight_writes() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();

    let reader = bed.txns.reader(IsolationLevel::Committed);
    let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
    assert_eq!(
        a.get("n").and_then(AttrValue::as_int),
        Some(1),
        "committed view answers from the before-image"
    );
    assert!(
        reader.get_item(&key("b"), true).await.unwrap().is_none(),
        "an uncommitted insert does not exist yet"
    );

    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn commit_moves_the_committed_view_forward() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();
    tx.commit().await.unwrap();

    let reader = bed.txns.reader(IsolationLevel::Committed);
    let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
    assert_eq!(a.get("n").and_then(AttrValue::as_int), Some(9));
    let b = reader.get_item(&key("b"), true).await.unwrap().unwrap();
    assert_eq!(b.get("n").and_then(AttrValue::as_int), Some(2));
}

#[tokio::test]
async fn rollback_keeps_the_old_view() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();
    tx.rollback().await.unwrap();

    for level in [IsolationLevel::Uncommitted, IsolationLevel::Committed] {
        let reader = bed.txns.reader(level);
        let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
        assert_eq!(a.get("n").and_then(AttrValue::as_int), Some(1));
        assert!(reader.get_item(&key("b"), true).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn a_committing_owner_reads_as_current() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    tx.put("items", item("b", 2)).await.unwrap();
    let id = tx.id().clone();

    // The outcome is decided once the record says Committing, even
    // before completion has released anything.
    let record = bed.txns.records().get(&id, true).await.unwrap();
    bed.txns
        .records()
        .set_state(&record, TxState::Committing)
        .await
        .unwrap();

    let reader = bed.txns.reader(IsolationLevel::Committed);
    let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
    assert_eq!(a.get("n").and_then(AttrValue::as_int), Some(9));
    let b = reader.get_item(&key("b"), true).await.unwrap().unwrap();
    assert_eq!(b.get("n").and_then(AttrValue::as_int), Some(2));

    bed.txns.commit(&id).await.unwrap();
}

#[tokio::test]
async fn lock_only_items_read_as_themselves() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    // A failed check leaves the lock in place with nothing applied; the
    // item is its own before-image.
    let tx = bed.txns.begin().await.unwrap();
    assert!(tx
        .check(key("a"), Condition::attr_eq("n", 99i64))
        .await
        .is_err());
    let raw = bed.raw("a").await.unwrap();
    assert!(lock_state(&raw).is_locked());

    for level in [IsolationLevel::Uncommitted, IsolationLevel::Committed] {
        let reader = bed.txns.reader(level);
        let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
        assert_eq!(a.get("n").and_then(AttrValue::as_int), Some(1));
    }

    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn readers_strip_lock_attributes() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();

    for level in [IsolationLevel::Uncommitted, IsolationLevel::Committed] {
        let reader = bed.txns.reader(level);
        let a = reader.get_item(&key("a"), true).await.unwrap().unwrap();
        assert!(
            a.keys().all(|attr| !attr.starts_with("_txn")),
            "reader leaked bookkeeping attributes: {:?}",
            a
        );
    }

    tx.rollback().await.unwrap();
}

// ============================================================================
// Batch Reads
// ============================================================================

#[tokio::test]
async fn batch_reads_follow_the_same_rules() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;
    bed.seed("c", 3).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();

    let keys = vec![key("a"), key("missing"), key("c")];

    let committed = bed.txns.reader(IsolationLevel::Committed);
    let got = committed.batch_get_items(&keys, true).await.unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(
        got[0].as_ref().and_then(|i| i.get("n").and_then(AttrValue::as_int)),
        Some(1)
    );
    assert!(got[1].is_none());
    assert_eq!(
        got[2].as_ref().and_then(|i| i.get("n").and_then(AttrValue::as_int)),
        Some(3)
    );

    let uncommitted = bed.txns.reader(IsolationLevel::Uncommitted);
    let got = uncommitted.batch_get_items(&keys, true).await.unwrap();
    assert_eq!(
        got[0].as_ref().and_then(|i| i.get("n").and_then(AttrValue::as_int)),
        Some(9)
    );

    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn transact_reads_follow_the_same_rules() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;
    bed.seed("c", 3).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();

    let committed = bed.txns.reader(IsolationLevel::Committed);
    let got = committed
        .transact_get_items(&[key("a"), key("c")])
        .await
        .unwrap();
    assert_eq!(
        got[0].as_ref().and_then(|i| i.get("n").and_then(AttrValue::as_int)),
        Some(1)
    );
    assert_eq!(
        got[1].as_ref().and_then(|i| i.get("n").and_then(AttrValue::as_int)),
        Some(3)
    );

    tx.rollback().await.unwrap();
}
