//! Record-free atomic writes
//!
//! An op set that fits the store's native atomic ceiling needs none of
//! the transaction machinery: one `transact_write` with a per-item
//! "unlocked" guard gives the same all-or-nothing outcome. This module
//! plans that call and interprets its failures; driving it, healing
//! included, stays with the coordinator.

use keyspan_core::{
    lock_state, visible_record, AttrCheck, Condition, ConditionFailure, LockConflict, TxError,
    TxResult, WriteOp, ATTR_LOCK_OWNER,
};
use keyspan_txn::request::ItemOp;

/// Map resolved ops onto native writes, each guarded by "no transaction
/// holds this item".
///
/// Locked items make the guard fail and the whole call cancel, so a
/// quick write can never tear a transaction's locked set. Caller
/// conditions ride along next to the guard. Reads are rejected: the
/// native call has no read slot, and a read inside a blind write has no
/// meaning anyway.
pub fn plan_writes(ops: &[ItemOp]) -> TxResult<Vec<WriteOp>> {
    ops.iter()
        .map(|op| match op {
            ItemOp::Get { key } => Err(TxError::Validation(format!(
                "atomic writes cannot read {}; use a transaction",
                key
            ))),
            ItemOp::Put { key, item } => Ok(WriteOp::Put {
                table: key.table.clone(),
                item: item.clone(),
                condition: Condition::attr_absent(ATTR_LOCK_OWNER),
            }),
            ItemOp::Update { key, ops } => Ok(WriteOp::Update {
                key: key.clone(),
                ops: ops.clone(),
                condition: Condition::attr_absent(ATTR_LOCK_OWNER),
            }),
            ItemOp::Delete { key } => Ok(WriteOp::Delete {
                key: key.clone(),
                condition: Condition::attr_absent(ATTR_LOCK_OWNER),
            }),
            ItemOp::ConditionCheck { key, condition } => Ok(WriteOp::ConditionCheck {
                key: key.clone(),
                condition: condition
                    .clone()
                    .and(AttrCheck::Absent(ATTR_LOCK_OWNER.into())),
            }),
        })
        .collect()
}

/// The subset of a canceled write's failures caused by foreign locks.
///
/// A failure whose item is unlocked (or missing) means a caller
/// condition did not hold; healing cannot change that and the caller
/// gets the cancellation as-is.
pub fn lock_conflicts(failures: &[ConditionFailure]) -> Vec<LockConflict> {
    failures
        .iter()
        .filter_map(|failure| {
            let raw = failure.current.as_ref()?;
            let state = lock_state(raw);
            let owner = state.owner.clone()?;
            Some(LockConflict {
                key: failure.key.clone(),
                owner,
                record: visible_record(raw),
                state,
            })
        })
        .collect()
}
