//! Healing decisions
//!
//! When lock acquisition runs into a foreign lock, the holder may be a
//! live transaction, a crashed one, or no transaction at all. The
//! decision of what to do lives here as a pure function over the
//! holder's record; carrying the decision out belongs to the coordinator.

use crate::record::{TxRecord, TxState};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do about one foreign lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    /// Holder is live; back off and let the caller retry or give up.
    LeaveAlone,
    /// Holder decided to commit and stalled; finish its commit.
    CompleteCommit,
    /// Holder stalled before deciding, or mid-rollback; roll it back.
    CompleteRollback,
    /// No record of the holder exists; strip the lock in place.
    ReleaseOrphanedLock,
}

/// Decide how to treat the holder of a contested lock.
///
/// `owner` is the holder's record as currently stored, or `None` when no
/// record exists. A missing record cannot mean an unfinished commit:
/// records outlive their locks because completion releases every lock
/// before the record becomes deletable.
///
/// Stale terminal records get the same treatment as stale completing
/// ones. Their completion is idempotent, and an item still locked under
/// a terminal record means a completion pass died partway through.
pub fn decide(owner: Option<&TxRecord>, staleness: Duration, now: DateTime<Utc>) -> HealAction {
    let record = match owner {
        Some(record) => record,
        None => return HealAction::ReleaseOrphanedLock,
    };
    if !record.is_stale(staleness, now) {
        return HealAction::LeaveAlone;
    }
    match record.state {
        TxState::Committing | TxState::Committed => HealAction::CompleteCommit,
        TxState::Active | TxState::RollingBack | TxState::RolledBack => {
            HealAction::CompleteRollback
        }
    }
}
