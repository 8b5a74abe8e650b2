//! Item locks
//!
//! A lock is nothing but the owner's id written into the item's
//! [`ATTR_LOCK_OWNER`] attribute with a conditional update. Everything
//! else follows from which conditions each step uses:
//!
//! - acquire: succeed only if no owner attribute exists
//! - apply: succeed only if we still own the item and have not applied yet
//! - release: succeed only if we still own the item; paths that assume
//!   the mutation never landed also require the applied marker to be
//!   absent, so a racing apply fails the release instead of freeing a
//!   value it never checked
//!
//! Items that do not exist are locked through a transient placeholder: a
//! row holding only the key and the lock attributes. Placeholders vanish
//! at release unless the transaction turned them into real items.
//!
//! Deletes are deferred. Deleting at apply time would drop the lock with
//! the item and let another transaction claim it mid-flight, so delete
//! ops keep the item locked and unchanged until commit release deletes it.

use crate::request::{ItemOp, RequestAction, TxRequest};
use keyspan_core::{
    lock_state, visible_record, AttrCheck, AttrMap, AttrValue, Condition, ConditionFailure,
    ItemKey, ItemRecord, ItemTxState, LockConflict, SharedStore, StoreError, TxError, TxId,
    TxResult, UpdateOp, ATTR_APPLIED, ATTR_LOCK_OWNER, ATTR_TRANSIENT,
};
use std::collections::BTreeMap;
use tracing::debug;

/// One item this transaction holds, as returned by acquisition.
///
/// `raw` is the item as stored right after locking, bookkeeping attributes
/// included. Until the mutation is applied its visible part is the
/// pre-transaction value, which is exactly what the backup step wants.
#[derive(Debug, Clone)]
pub struct LockedItem {
    /// Decoded lock state
    pub state: ItemTxState,
    /// Full item as stored, reserved attributes included
    pub raw: AttrMap,
}

impl LockedItem {
    /// Visible record of this item; `None` for a placeholder that was
    /// never written into existence.
    pub fn visible(&self) -> Option<ItemRecord> {
        if self.state.transient && !self.state.applied {
            None
        } else {
            Some(visible_record(&self.raw))
        }
    }
}

/// Every item one request holds, keyed by item.
pub type LockedItems = BTreeMap<ItemKey, LockedItem>;

/// How one item leaves a transaction at release time.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Keep the current value, strip the lock attributes.
    Unlock,
    /// Strip the lock attributes only while no mutation has landed.
    /// An apply racing the release fails the condition rather than
    /// having its write freed as if it were the original value.
    UnlockUnapplied,
    /// Remove the item entirely.
    Delete,
    /// Remove the item only while no mutation has landed.
    DeleteUnapplied,
    /// Write back the before-image, which clears the lock with it.
    Restore(ItemRecord),
}

/// Decide an item's fate at release time.
///
/// `action` is the single action that governs the item (the write action
/// if the transaction wrote it, Get otherwise). `image` is the item's
/// before-image if one was saved.
pub fn release_disposition(
    key: &ItemKey,
    action: RequestAction,
    state: &ItemTxState,
    rollback: bool,
    image: Option<ItemRecord>,
) -> TxResult<Disposition> {
    if rollback {
        if state.transient {
            return Ok(Disposition::Delete);
        }
        if !state.applied {
            // The current value is the original only until an apply
            // lands; the guard turns that race into a failed release.
            return Ok(Disposition::UnlockUnapplied);
        }
        return match image {
            Some(record) => Ok(Disposition::Restore(record)),
            None => Err(TxError::Assertion(format!(
                "rolling back applied item {} with no before-image",
                key
            ))),
        };
    }
    if action == RequestAction::Delete {
        return Ok(Disposition::Delete);
    }
    if state.transient && !state.applied {
        // A placeholder the transaction never turned into a real item
        // must not outlive it, even on commit. Guarded, because a drain
        // racing this release may still be about to write it.
        return Ok(Disposition::DeleteUnapplied);
    }
    Ok(Disposition::Unlock)
}

/// Before-images worth saving for one request: items a write op is about
/// to mutate, captured at lock time.
///
/// Transients are skipped (there is nothing to restore) and so are items
/// already applied: their current value is a post-image, and overwriting
/// the saved original would corrupt rollback.
pub fn items_to_backup(request: &TxRequest, locked: &LockedItems) -> Vec<(ItemKey, ItemRecord)> {
    request
        .ops
        .iter()
        .filter(|op| op.action().is_write())
        .filter_map(|op| {
            let held = locked.get(op.key())?;
            if held.state.transient || held.state.applied {
                return None;
            }
            Some((op.key().clone(), visible_record(&held.raw)))
        })
        .collect()
}

enum AcquireOutcome {
    Locked(LockedItem),
    Conflict(LockConflict),
}

/// Lock acquisition, mutation apply and lock release against the store.
#[derive(Clone)]
pub struct LockedItemStore {
    store: SharedStore,
    acquire_attempts: u32,
}

impl LockedItemStore {
    /// Create a lock store with the default race-retry budget.
    pub fn new(store: SharedStore) -> Self {
        LockedItemStore {
            store,
            acquire_attempts: 3,
        }
    }

    /// Override how many times one item acquisition may race before
    /// giving up.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.acquire_attempts = attempts.max(1);
        self
    }

    /// Lock every key for `owner`.
    ///
    /// Re-acquiring an item the owner already holds is a no-op. If any
    /// item is held by another transaction the whole call fails with
    /// [`TxError::Conflict`] carrying every contested item; locks taken
    /// for the other keys stay with the owner, and retrying after the
    /// conflicts heal re-acquires them silently.
    pub async fn acquire(&self, owner: &TxId, keys: &[ItemKey]) -> TxResult<LockedItems> {
        let mut locked = LockedItems::new();
        let mut conflicts = Vec::new();
        for key in keys {
            match self.acquire_one(owner, key).await? {
                AcquireOutcome::Locked(item) => {
                    locked.insert(key.clone(), item);
                }
                AcquireOutcome::Conflict(conflict) => conflicts.push(conflict),
            }
        }
        if !conflicts.is_empty() {
            debug!(
                target: "keyspan::lock",
                tx = %owner,
                contested = conflicts.len(),
                "lock acquisition hit foreign locks"
            );
            return Err(TxError::Conflict { conflicts });
        }
        Ok(locked)
    }

    async fn acquire_one(&self, owner: &TxId, key: &ItemKey) -> TxResult<AcquireOutcome> {
        for _ in 0..self.acquire_attempts {
            // Claim an existing, unlocked item.
            let claim = self
                .store
                .update_item(
                    key,
                    vec![UpdateOp::Set(
                        ATTR_LOCK_OWNER.into(),
                        AttrValue::Str(owner.as_str().into()),
                    )],
                    Condition::item_exists().and(AttrCheck::Absent(ATTR_LOCK_OWNER.into())),
                )
                .await;
            let failure = match claim {
                Ok(raw) => {
                    return Ok(AcquireOutcome::Locked(LockedItem {
                        state: lock_state(&raw),
                        raw,
                    }))
                }
                Err(StoreError::ConditionFailed(failure)) => failure,
                Err(e) => return Err(e.into()),
            };
            match failure.current {
                None => {
                    // No such item: create a transient placeholder that
                    // exists only to hold the lock.
                    let mut placeholder: AttrMap = key.pk_values().collect();
                    placeholder.insert(
                        ATTR_LOCK_OWNER.into(),
                        AttrValue::Str(owner.as_str().into()),
                    );
                    placeholder.insert(ATTR_TRANSIENT.into(), AttrValue::Bool(true));
                    match self
                        .store
                        .put_item(&key.table, placeholder.clone(), Condition::item_not_exists())
                        .await
                    {
                        Ok(()) => {
                            return Ok(AcquireOutcome::Locked(LockedItem {
                                state: lock_state(&placeholder),
                                raw: placeholder,
                            }))
                        }
                        // Someone created the item first; start over.
                        Err(StoreError::ConditionFailed(_)) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(current) => {
                    let state = lock_state(&current);
                    match state.owner.clone() {
                        Some(holder) if holder == *owner => {
                            // Already ours, possibly from an earlier
                            // attempt of this same request.
                            return Ok(AcquireOutcome::Locked(LockedItem {
                                state,
                                raw: current,
                            }));
                        }
                        Some(holder) => {
                            return Ok(AcquireOutcome::Conflict(LockConflict {
                                key: key.clone(),
                                owner: holder,
                                record: visible_record(&current),
                                state,
                            }))
                        }
                        // Exists and unlocked, yet the claim failed: the
                        // item changed between evaluation and our read.
                        None => continue,
                    }
                }
            }
        }
        Err(TxError::Assertion(format!(
            "could not lock {} after {} attempts, item kept churning",
            key, self.acquire_attempts
        )))
    }

    /// Apply one request's mutations under its locks.
    ///
    /// Safe to call again for a request that already applied: every write
    /// is guarded by the applied marker, and a marker hit turns into a
    /// read of the current value instead of a second mutation.
    ///
    /// Returns one outcome per op, in op order: the visible item after a
    /// put or update, the visible item read by a get or check, the
    /// before-image for a delete, `None` where the item does not exist.
    pub async fn apply(
        &self,
        owner: &TxId,
        request: &TxRequest,
        locked: &LockedItems,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        let mut outcomes = Vec::with_capacity(request.ops.len());
        for op in &request.ops {
            let held = locked.get(op.key()).ok_or_else(|| {
                TxError::Assertion(format!("applying {} without holding its lock", op.key()))
            })?;
            let outcome = match op {
                ItemOp::Get { .. } => held.visible(),
                ItemOp::Put { key, item } => {
                    let mut stamped = item.clone();
                    stamped.insert(
                        ATTR_LOCK_OWNER.into(),
                        AttrValue::Str(owner.as_str().into()),
                    );
                    stamped.insert(ATTR_APPLIED.into(), AttrValue::Bool(true));
                    if held.state.transient {
                        stamped.insert(ATTR_TRANSIENT.into(), AttrValue::Bool(true));
                    }
                    let written = self
                        .store
                        .put_item(&key.table, stamped.clone(), owned_unapplied(owner))
                        .await;
                    match written {
                        Ok(()) => Some(visible_record(&stamped)),
                        Err(StoreError::ConditionFailed(failure)) => {
                            Some(already_applied(owner, key, failure)?)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ItemOp::Update { key, ops } => {
                    let mut steps = ops.clone();
                    steps.push(UpdateOp::Set(ATTR_APPLIED.into(), AttrValue::Bool(true)));
                    let written = self
                        .store
                        .update_item(key, steps, owned_unapplied(owner))
                        .await;
                    match written {
                        Ok(raw) => Some(visible_record(&raw)),
                        Err(StoreError::ConditionFailed(failure)) => {
                            Some(already_applied(owner, key, failure)?)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                // Deferred to commit release; outcome is the value being
                // deleted.
                ItemOp::Delete { .. } => held.visible(),
                ItemOp::ConditionCheck { key, condition } => {
                    let current = held.visible();
                    if !condition.eval(current.as_ref()) {
                        return Err(TxError::Validation(format!(
                            "condition check failed on {}",
                            key
                        )));
                    }
                    current
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Release one item per its disposition.
    ///
    /// Every path is conditioned on the owner still holding the lock;
    /// the unapplied dispositions also require that no mutation landed.
    /// Returns whether the write went through: `Ok(false)` means the
    /// condition failed because the item moved on, and the caller picks
    /// between accepting that and deciding again from the new state.
    pub async fn release(
        &self,
        owner: &TxId,
        key: &ItemKey,
        disposition: Disposition,
    ) -> TxResult<bool> {
        let owned = Condition::attr_eq(ATTR_LOCK_OWNER, owner.as_str());
        let result = match disposition {
            Disposition::Unlock => self
                .store
                .update_item(key, strip_ops(), owned)
                .await
                .map(|_| ()),
            Disposition::UnlockUnapplied => self
                .store
                .update_item(key, strip_ops(), owned_unapplied(owner))
                .await
                .map(|_| ()),
            Disposition::Delete => self.store.delete_item(key, owned).await.map(|_| ()),
            Disposition::DeleteUnapplied => self
                .store
                .delete_item(key, owned_unapplied(owner))
                .await
                .map(|_| ()),
            Disposition::Restore(record) => {
                // The before-image carries no lock attributes; writing it
                // back restores the value and frees the item in one step.
                self.store.put_item(&key.table, record, owned).await
            }
        };
        match result {
            Ok(()) => Ok(true),
            Err(StoreError::ConditionFailed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Free an item whose owner has no transaction record.
    ///
    /// Only never-applied locks can be orphaned: applied mutations imply
    /// a record existed, so an applied orphan means corruption and fails
    /// loudly instead of guessing.
    pub async fn force_release(&self, conflict: &LockConflict) -> TxResult<()> {
        if conflict.state.applied {
            return Err(TxError::Assertion(format!(
                "item {} carries an applied mutation of unknown transaction {}",
                conflict.key, conflict.owner
            )));
        }
        debug!(
            target: "keyspan::lock",
            item = %conflict.key,
            holder = %conflict.owner,
            "releasing orphaned lock"
        );
        let held_by = Condition::attr_eq(ATTR_LOCK_OWNER, conflict.owner.as_str())
            .and(AttrCheck::Absent(ATTR_APPLIED.into()));
        let result = if conflict.state.transient {
            self.store
                .delete_item(&conflict.key, held_by)
                .await
                .map(|_| ())
        } else {
            self.store
                .update_item(&conflict.key, strip_ops(), held_by)
                .await
                .map(|_| ())
        };
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current raw state of an item, for release paths that resume after
    /// a crash and hold no in-memory view.
    pub async fn current(&self, key: &ItemKey) -> TxResult<Option<AttrMap>> {
        Ok(self.store.get_item(key, true).await?)
    }
}

fn owned_unapplied(owner: &TxId) -> Condition {
    Condition::attr_eq(ATTR_LOCK_OWNER, owner.as_str())
        .and(AttrCheck::Absent(ATTR_APPLIED.into()))
}

fn strip_ops() -> Vec<UpdateOp> {
    vec![
        UpdateOp::Remove(ATTR_LOCK_OWNER.into()),
        UpdateOp::Remove(ATTR_APPLIED.into()),
        UpdateOp::Remove(ATTR_TRANSIENT.into()),
    ]
}

/// An apply condition failed. Fine if this exact mutation already landed
/// (still ours, applied marker set); anything else means the lock was
/// lost, which the protocol never allows.
fn already_applied(
    owner: &TxId,
    key: &ItemKey,
    failure: ConditionFailure,
) -> TxResult<ItemRecord> {
    if let Some(current) = failure.current {
        let state = lock_state(&current);
        if state.locked_by(owner) && state.applied {
            return Ok(visible_record(&current));
        }
    }
    Err(TxError::Assertion(format!(
        "lost the lock on {} while applying for {}",
        key, owner
    )))
}
