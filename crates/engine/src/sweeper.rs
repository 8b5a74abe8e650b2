//! House-keeping
//!
//! Transactions leave durable traces: records of finished transactions
//! waiting to be forgotten, and abandoned Active transactions still
//! holding locks. The sweeper walks the record table and resolves both,
//! either on demand ([`Sweeper::run_house_keeping`]) or from a periodic
//! background task ([`Sweeper::spawn_periodic`]).
//!
//! Every intervention reuses the coordinator's completion paths, so a
//! sweep can never do something a crashed caller could not have done
//! itself.

use crate::coordinator::TxCoordinator;
use chrono::Utc;
use keyspan_core::{TxId, TxResult};
use keyspan_txn::record::{TxRecord, TxState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one sweep did about one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Terminal record old enough to forget; deleted.
    Removed,
    /// Abandoned Active transaction; rolled back.
    RolledBack,
    /// Stalled Committing transaction; commit driven to the end.
    CompletedCommit,
    /// Stalled RollingBack transaction; rollback driven to the end.
    CompletedRollback,
    /// Nothing to do yet.
    LeftAlone,
    /// The intervention failed; the next sweep will see it again.
    Failed(String),
}

/// Outcome of one sweep for one transaction.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Transaction the sweep looked at
    pub tx_id: TxId,
    /// What was done about it
    pub action: SweepAction,
}

/// Walks transaction records and resolves the ones needing attention.
#[derive(Clone)]
pub struct Sweeper {
    coordinator: Arc<TxCoordinator>,
}

impl Sweeper {
    /// Create a sweeper over a coordinator.
    pub fn new(coordinator: Arc<TxCoordinator>) -> Self {
        Sweeper { coordinator }
    }

    /// Sweep up to `limit` transaction records once.
    ///
    /// Returns one outcome per record seen. A failed intervention is
    /// reported in its outcome and never aborts the rest of the sweep.
    pub async fn run_house_keeping(&self, limit: Option<usize>) -> TxResult<Vec<SweepOutcome>> {
        let records = self.coordinator.records().list(limit).await?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let tx_id = record.id.clone();
            let action = match self.sweep_one(record).await {
                Ok(action) => action,
                Err(e) if e.is_terminal_state() => {
                    // Someone finished it between listing and acting.
                    SweepAction::LeftAlone
                }
                Err(e) => {
                    warn!(
                        target: "keyspan::sweep",
                        tx = %tx_id,
                        error = %e,
                        "house-keeping intervention failed"
                    );
                    SweepAction::Failed(e.to_string())
                }
            };
            debug!(target: "keyspan::sweep", tx = %tx_id, action = ?action, "swept transaction");
            outcomes.push(SweepOutcome { tx_id, action });
        }
        Ok(outcomes)
    }

    async fn sweep_one(&self, record: TxRecord) -> TxResult<SweepAction> {
        let config = self.coordinator.config();
        match record.state {
            TxState::Committed | TxState::RolledBack => {
                if self
                    .coordinator
                    .records()
                    .try_remove(&record.id, config.delete_after)
                    .await?
                {
                    Ok(SweepAction::Removed)
                } else {
                    Ok(SweepAction::LeftAlone)
                }
            }
            TxState::Active => {
                if !record.is_stale(config.rollback_after, Utc::now()) {
                    return Ok(SweepAction::LeftAlone);
                }
                info!(
                    target: "keyspan::sweep",
                    tx = %record.id,
                    "rolling back abandoned transaction"
                );
                self.coordinator.rollback(&record.id).await?;
                Ok(SweepAction::RolledBack)
            }
            TxState::Committing => {
                info!(
                    target: "keyspan::sweep",
                    tx = %record.id,
                    "driving stalled commit to completion"
                );
                self.coordinator.commit(&record.id).await?;
                Ok(SweepAction::CompletedCommit)
            }
            TxState::RollingBack => {
                info!(
                    target: "keyspan::sweep",
                    tx = %record.id,
                    "driving stalled rollback to completion"
                );
                self.coordinator.rollback(&record.id).await?;
                Ok(SweepAction::CompletedRollback)
            }
        }
    }

    /// Run sweeps on a fixed interval until the handle is shut down.
    ///
    /// The first sweep runs immediately. Sweep failures are logged and
    /// the loop keeps going.
    pub fn spawn_periodic(self, interval: Duration, limit: Option<usize>) -> SweeperHandle {
        let (shutdown, mut watcher) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_house_keeping(limit).await {
                            Ok(outcomes) => {
                                let acted = outcomes
                                    .iter()
                                    .filter(|o| o.action != SweepAction::LeftAlone)
                                    .count();
                                if acted > 0 {
                                    info!(
                                        target: "keyspan::sweep",
                                        seen = outcomes.len(),
                                        acted,
                                        "periodic sweep finished"
                                    );
                                }
                            }
                            Err(e) => {
                                warn!(target: "keyspan::sweep", error = %e, "periodic sweep failed");
                            }
                        }
                    }
                    changed = watcher.changed() => {
                        if changed.is_err() || *watcher.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "keyspan::sweep", "periodic sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

/// Handle to a running periodic sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
