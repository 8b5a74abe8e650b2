//! House-Keeping Tests
//!
//! The sweeper against real records: removing aged-out terminal
//! transactions, rolling back abandoned ones, finishing stalled
//! completions, and leaving everything else alone.

use crate::common::*;
use std::time::Duration;

fn sweeper(bed: &TestBed) -> Sweeper {
    Sweeper::new(bed.txns.clone())
}

#[tokio::test]
async fn finished_records_age_out_while_live_ones_stay() {
    let bed = TestBed::with_config(EngineConfig::default().with_delete_after(Duration::ZERO));

    let live = bed.txns.begin().await.unwrap();
    let live_id = live.id().clone();
    let done = bed.txns.begin().await.unwrap();
    let done_id = done.id().clone();
    done.commit().await.unwrap();

    let outcomes = sweeper(&bed).run_house_keeping(None).await.unwrap();
    let action_of = |id: &TxId| {
        outcomes
            .iter()
            .find(|o| &o.tx_id == id)
            .map(|o| o.action.clone())
            .unwrap()
    };
    assert_eq!(action_of(&live_id), SweepAction::LeftAlone);
    assert_eq!(action_of(&done_id), SweepAction::Removed);

    let remaining = bed.txns.records().list(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, live_id);
    assert_eq!(remaining[0].state, TxState::Active);

    // Surviving the sweep, the live transaction still works.
    live.update(key("a"), set_n(1)).await.unwrap();
    live.commit().await.unwrap();
    assert_eq!(bed.n_of("a").await, Some(1));
}

#[tokio::test]
async fn abandoned_transactions_are_rolled_back_then_removed() {
    let bed = TestBed::with_config(
        EngineConfig::default()
            .with_rollback_after(Duration::ZERO)
            .with_delete_after(Duration::ZERO),
    );
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    let abandoned = tx.id().clone();
    drop(tx);

    let outcomes = sweeper(&bed).run_house_keeping(None).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].action, SweepAction::RolledBack);
    assert_eq!(
        bed.txns.status(&abandoned).await.unwrap(),
        TxState::RolledBack
    );
    assert_eq!(bed.n_of("a").await, Some(1), "the write must be undone");
    bed.assert_unlocked("a").await;
    assert_eq!(bed.images(), 0);

    // Terminal now, so the next sweep forgets it.
    let outcomes = sweeper(&bed).run_house_keeping(None).await.unwrap();
    assert_eq!(outcomes[0].action, SweepAction::Removed);
    assert!(bed.txns.records().list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_completions_are_driven_forward() {
    let bed = TestBed::patient();
    bed.seed("a", 1).await;
    bed.seed("b", 1).await;

    let committing = bed.txns.begin().await.unwrap();
    committing.update(key("a"), set_n(9)).await.unwrap();
    let committing_id = committing.id().clone();
    let record = bed.txns.records().get(&committing_id, true).await.unwrap();
    bed.txns
        .records()
        .set_state(&record, TxState::Committing)
        .await
        .unwrap();

    let rolling = bed.txns.begin().await.unwrap();
    rolling.update(key("b"), set_n(9)).await.unwrap();
    let rolling_id = rolling.id().clone();
    let record = bed.txns.records().get(&rolling_id, true).await.unwrap();
    bed.txns
        .records()
        .set_state(&record, TxState::RollingBack)
        .await
        .unwrap();

    let outcomes = sweeper(&bed).run_house_keeping(None).await.unwrap();
    let action_of = |id: &TxId| {
        outcomes
            .iter()
            .find(|o| &o.tx_id == id)
            .map(|o| o.action.clone())
            .unwrap()
    };
    assert_eq!(action_of(&committing_id), SweepAction::CompletedCommit);
    assert_eq!(action_of(&rolling_id), SweepAction::CompletedRollback);

    assert_eq!(bed.n_of("a").await, Some(9));
    assert_eq!(bed.n_of("b").await, Some(1));
    bed.assert_unlocked("a").await;
    bed.assert_unlocked("b").await;

    // No record may remain mid-completion after a sweep.
    let records = bed.txns.records().list(None).await.unwrap();
    assert!(records
        .iter()
        .all(|r| matches!(r.state, TxState::Committed | TxState::RolledBack)));

    // Young terminal records are kept for audit until they age out.
    let outcomes = sweeper(&bed).run_house_keeping(None).await.unwrap();
    assert!(outcomes.iter().all(|o| o.action == SweepAction::LeftAlone));
}

#[tokio::test]
async fn the_periodic_sweeper_cleans_up_on_its_own() {
    let bed = TestBed::with_config(
        EngineConfig::default()
            .with_rollback_after(Duration::ZERO)
            .with_delete_after(Duration::ZERO),
    );
    bed.seed("a", 1).await;

    let tx = bed.txns.begin().await.unwrap();
    tx.update(key("a"), set_n(9)).await.unwrap();
    drop(tx);

    let handle = sweeper(&bed).spawn_periodic(Duration::from_millis(5), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    assert!(bed.txns.records().list(None).await.unwrap().is_empty());
    assert_eq!(bed.n_of("a").await, Some(1));
    bed.assert_unlocked("a").await;
}
