//! Transaction coordinator
//!
//! Top-level orchestration of the protocol: begin/resume/commit/rollback,
//! the per-request processing pipeline, completion of stalled
//! transactions, conflict healing and the record-free quick path for
//! small atomic writes.
//!
//! The coordinator holds no transaction state in memory beyond the
//! applied-request set. Everything it decides on is re-read from the
//! store, so any number of coordinator instances can drive the same
//! transactions concurrently; conditional writes arbitrate.
//!
//! # Memory Ordering
//!
//! The metric counters use Relaxed ordering intentionally: they are
//! observational only, synchronize nothing, and approximate counts under
//! contention are acceptable.

use crate::batch::chunk_ops;
use crate::config::EngineConfig;
use crate::quick;
use crate::read::{CommittedReads, IsolatedReads, IsolationLevel, UncommittedReads};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use keyspan_core::{
    lock_state, Condition, ItemKey, ItemRecord, LockConflict, SharedStore, StoreError, TxError,
    TxId, TxResult, TxVersion, UpdateOp,
};
use keyspan_txn::applied::{InMemoryAppliedSet, SharedAppliedSet};
use keyspan_txn::healing::{self, HealAction};
use keyspan_txn::images::ItemImageStore;
use keyspan_txn::lock::{
    items_to_backup, release_disposition, Disposition, LockedItems, LockedItemStore,
};
use keyspan_txn::record::{TxRecord, TxState};
use keyspan_txn::record_store::TxRecordStore;
use keyspan_txn::request::{
    ensure_no_write_overlap, put_key, validate_ops, ItemOp, ItemRequest, TxRequest,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How often release may lose a race on one item and decide again.
const RELEASE_ATTEMPTS: u32 = 3;

/// How a request is being driven through the apply steps.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ApplyMode {
    /// Fresh submission on an Active transaction: heal contested locks
    /// once, and re-verify the transaction before mutating.
    Live,
    /// Draining during commit completion: the decision is made, a
    /// contested lock is a hard error, no re-verification.
    Drain,
}

/// Snapshot of coordinator counters.
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    /// Transactions begun through this coordinator
    pub begun: u64,
    /// Commit completions this coordinator finished
    pub committed: u64,
    /// Rollback completions this coordinator finished
    pub rolled_back: u64,
    /// Foreign transactions healed (completed or force-released)
    pub conflicts_healed: u64,
    /// Record-free atomic writes that went through
    pub quick_writes: u64,
}

impl CoordinatorStats {
    /// Completions of either kind.
    pub fn completed(&self) -> u64 {
        self.committed + self.rolled_back
    }
}

/// Drives transactions against one backing store.
pub struct TxCoordinator {
    store: SharedStore,
    records: TxRecordStore,
    locks: LockedItemStore,
    images: ItemImageStore,
    applied: SharedAppliedSet,
    config: EngineConfig,
    /// Key schemas by table, fetched once per table
    schemas: DashMap<String, Arc<Vec<String>>>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    conflicts_healed: AtomicU64,
    quick_writes: AtomicU64,
}

impl TxCoordinator {
    /// Create a coordinator with default configuration.
    pub fn new(store: SharedStore) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create a coordinator with explicit configuration.
    pub fn with_config(store: SharedStore, config: EngineConfig) -> Self {
        let records = TxRecordStore::new(store.clone(), config.tx_table.as_str());
        let locks = LockedItemStore::new(store.clone());
        let images = ItemImageStore::new(store.clone(), config.image_table.as_str());
        TxCoordinator {
            store,
            records,
            locks,
            images,
            applied: Arc::new(InMemoryAppliedSet::new()),
            config,
            schemas: DashMap::new(),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            conflicts_healed: AtomicU64::new(0),
            quick_writes: AtomicU64::new(0),
        }
    }

    /// Swap in a durable applied-request tracker. Required when several
    /// processes drive the same transaction table.
    pub fn with_applied_set(mut self, applied: SharedAppliedSet) -> Self {
        self.applied = applied;
        self
    }

    /// The record store this coordinator writes through.
    pub fn records(&self) -> &TxRecordStore {
        &self.records
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the coordinator counters.
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            conflicts_healed: self.conflicts_healed.load(Ordering::Relaxed),
            quick_writes: self.quick_writes.load(Ordering::Relaxed),
        }
    }

    /// A read service for the given isolation level, sharing this
    /// coordinator's stores.
    pub fn reader(&self, level: IsolationLevel) -> Arc<dyn IsolatedReads> {
        match level {
            IsolationLevel::Uncommitted => Arc::new(UncommittedReads::new(self.store.clone())),
            IsolationLevel::Committed => Arc::new(CommittedReads::new(
                self.store.clone(),
                self.records.clone(),
                self.images.clone(),
            )),
        }
    }

    /// Start a new transaction.
    pub async fn begin(&self) -> TxResult<TxHandle<'_>> {
        let id = TxId::generate();
        let record = TxRecord::new(id.clone());
        self.records.insert(&record).await?;
        self.begun.fetch_add(1, Ordering::Relaxed);
        info!(target: "keyspan::txn", tx = %id, "transaction begun");
        Ok(TxHandle {
            coordinator: self,
            id,
        })
    }

    /// Pick up an existing transaction by id.
    ///
    /// Re-reads the record; fails with [`TxError::NotFound`] if no such
    /// transaction exists (or it was already swept away).
    pub async fn resume(&self, id: &TxId) -> TxResult<TxHandle<'_>> {
        let record = self.records.get(id, true).await?;
        debug!(
            target: "keyspan::txn",
            tx = %id,
            state = %record.state,
            requests = record.requests.len(),
            "transaction resumed"
        );
        Ok(TxHandle {
            coordinator: self,
            id: record.id,
        })
    }

    /// Current lifecycle state of a transaction.
    pub async fn status(&self, id: &TxId) -> TxResult<TxState> {
        Ok(self.records.get(id, true).await?.state)
    }

    /// Run a group of item operations inside a transaction.
    ///
    /// Op sets larger than the store's native atomic limit are split into
    /// ordered requests; the whole set still commits or rolls back with
    /// the transaction. Returns one outcome per op, in submission order.
    pub async fn execute(
        &self,
        id: &TxId,
        requests: Vec<ItemRequest>,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        let ops = self.resolve_ops(requests).await?;
        let limit = self.store.limits().transact_write_items;
        if ops.len() <= limit {
            return self.process_ops(id, ops).await;
        }
        let mut outcomes = Vec::with_capacity(ops.len());
        for batch in chunk_ops(ops, limit) {
            outcomes.extend(self.process_ops(id, batch).await?);
        }
        Ok(outcomes)
    }

    /// Commit a transaction.
    ///
    /// Drains requests that never finished applying, releases every lock
    /// keeping current values, purges before-images and marks the record
    /// Committed. Committing a Committed transaction is a no-op;
    /// committing one that rolled back (or is rolling back) fails with
    /// [`TxError::AlreadyRolledBack`].
    pub async fn commit(&self, id: &TxId) -> TxResult<()> {
        let mut attempt = 0;
        loop {
            let record = self.records.get(id, true).await?;
            let step = match record.state {
                TxState::Active => match self.records.set_state(&record, TxState::Committing).await
                {
                    Ok(committing) => self.complete_commit(&committing).await,
                    Err(e) => Err(e),
                },
                TxState::Committing => self.complete_commit(&record).await,
                TxState::Committed => Ok(()),
                TxState::RollingBack | TxState::RolledBack => {
                    return Err(TxError::AlreadyRolledBack(id.clone()))
                }
            };
            match step {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    debug!(
                        target: "keyspan::txn",
                        tx = %id,
                        attempt,
                        error = %e,
                        "retrying commit after race"
                    );
                    tokio::time::sleep(self.config.retry.calculate_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Roll a transaction back.
    ///
    /// Restores before-images of applied mutations, removes transient
    /// items, releases locks, purges images and marks the record
    /// RolledBack. Rolling back a RolledBack transaction is a no-op;
    /// rolling back one that committed (or is committing) fails with
    /// [`TxError::AlreadyCommitted`].
    pub async fn rollback(&self, id: &TxId) -> TxResult<()> {
        let mut attempt = 0;
        loop {
            let record = self.records.get(id, true).await?;
            let step = match record.state {
                TxState::Active => {
                    match self.records.set_state(&record, TxState::RollingBack).await {
                        Ok(rolling) => self.complete_rollback(&rolling).await,
                        Err(e) => Err(e),
                    }
                }
                TxState::RollingBack => self.complete_rollback(&record).await,
                TxState::RolledBack => Ok(()),
                TxState::Committing | TxState::Committed => {
                    return Err(TxError::AlreadyCommitted(id.clone()))
                }
            };
            match step {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    debug!(
                        target: "keyspan::txn",
                        tx = %id,
                        attempt,
                        error = %e,
                        "retrying rollback after race"
                    );
                    tokio::time::sleep(self.config.retry.calculate_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One-shot atomic write of a small op set.
    ///
    /// When the set fits the store's native atomic limit and quick writes
    /// are enabled, this skips the transaction record entirely: one
    /// native call with per-item "unlocked" conditions. A cancellation
    /// caused by foreign locks triggers healing and exactly one retry.
    /// Oversized sets, or coordinators with the fast path disabled, fall
    /// back to a full begin-execute-commit envelope.
    pub async fn write_atomic(&self, requests: Vec<ItemRequest>) -> TxResult<()> {
        let ops = self.resolve_ops(requests).await?;
        validate_ops(&ops)?;
        if !self.config.quick_writes || ops.len() > self.store.limits().transact_write_items {
            return self.enveloped_write(ops).await;
        }
        let writes = quick::plan_writes(&ops)?;
        let attempt_id = TxId::quick();
        debug!(
            target: "keyspan::quick",
            id = %attempt_id,
            items = writes.len(),
            "attempting record-free atomic write"
        );
        match self.store.transact_write(writes.clone()).await {
            Ok(()) => {
                self.quick_writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(StoreError::WriteCanceled { failures }) => {
                let conflicts = quick::lock_conflicts(&failures);
                if conflicts.is_empty() {
                    // Caller conditions failed; healing cannot help.
                    return Err(StoreError::WriteCanceled { failures }.into());
                }
                self.heal_conflicts(&conflicts).await?;
                let retry_id = TxId::quick();
                debug!(
                    target: "keyspan::quick",
                    id = %retry_id,
                    healed = conflicts.len(),
                    "retrying atomic write after healing"
                );
                match self.store.transact_write(writes).await {
                    Ok(()) => {
                        self.quick_writes.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(StoreError::WriteCanceled { failures }) => {
                        let conflicts = quick::lock_conflicts(&failures);
                        if conflicts.is_empty() {
                            return Err(StoreError::WriteCanceled { failures }.into());
                        }
                        // A live owner survived healing; the caller decides
                        // whether to retry or fall back to a transaction.
                        Err(TxError::Conflict { conflicts })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Full-envelope fallback for [`TxCoordinator::write_atomic`].
    async fn enveloped_write(&self, ops: Vec<ItemOp>) -> TxResult<()> {
        let handle = self.begin().await?;
        let id = handle.id().clone();
        let limit = self.store.limits().transact_write_items;
        for batch in chunk_ops(ops, limit) {
            if let Err(e) = self.process_ops(&id, batch).await {
                if let Err(undo) = self.rollback(&id).await {
                    warn!(
                        target: "keyspan::txn",
                        tx = %id,
                        error = %undo,
                        "rollback after failed atomic write also failed"
                    );
                }
                return Err(e);
            }
        }
        self.commit(&id).await
    }

    /// Turn caller requests into logged ops, deriving put keys from the
    /// table schema.
    async fn resolve_ops(&self, requests: Vec<ItemRequest>) -> TxResult<Vec<ItemOp>> {
        let mut ops = Vec::with_capacity(requests.len());
        for request in requests {
            ops.push(match request {
                ItemRequest::Get { key } => ItemOp::Get { key },
                ItemRequest::Put { table, item } => {
                    let schema = self.schema(&table).await?;
                    let key = put_key(&table, schema.as_slice(), &item)?;
                    ItemOp::Put { key, item }
                }
                ItemRequest::Update { key, ops: steps } => ItemOp::Update { key, ops: steps },
                ItemRequest::Delete { key } => ItemOp::Delete { key },
                ItemRequest::ConditionCheck { key, condition } => {
                    ItemOp::ConditionCheck { key, condition }
                }
            });
        }
        Ok(ops)
    }

    async fn schema(&self, table: &str) -> TxResult<Arc<Vec<String>>> {
        if let Some(schema) = self.schemas.get(table) {
            return Ok(schema.clone());
        }
        let schema = Arc::new(self.store.key_schema(table).await?);
        self.schemas.insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    /// The request pipeline: validate, append, lock, back up, re-verify,
    /// apply, mark applied.
    async fn process_ops(
        &self,
        id: &TxId,
        ops: Vec<ItemOp>,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        validate_ops(&ops)?;
        let mut attempt = 0;
        loop {
            let record = self.records.get(id, true).await?;
            ensure_active(&record)?;
            ensure_no_write_overlap(&record.requests, &ops)?;
            let appended = match self.records.append_request(&record, ops.clone()).await {
                Ok(appended) => appended,
                // Lost the append race; re-fetch and try again.
                Err(TxError::VersionConflict { .. })
                    if attempt < self.config.retry.max_retries =>
                {
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.calculate_delay(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let request = appended
                .requests
                .last()
                .cloned()
                .ok_or_else(|| TxError::Assertion("append produced an empty log".into()))?;
            debug!(
                target: "keyspan::txn",
                tx = %id,
                request = request.id,
                ops = request.ops.len(),
                "request appended"
            );
            return self.apply_request(&appended, &request, ApplyMode::Live).await;
        }
    }

    /// Steps 3 through 7 of the pipeline for one logged request.
    ///
    /// Also the replay path: a request already marked fully applied is
    /// answered from its locked items without writing anything.
    async fn apply_request(
        &self,
        record: &TxRecord,
        request: &TxRequest,
        mode: ApplyMode,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        let tv = TxVersion::new(record.id.clone(), request.id);
        if self.applied.contains(&tv).await? {
            let locked = self.locks.acquire(&record.id, &request.keys()).await?;
            debug!(target: "keyspan::txn", tx = %record.id, request = request.id, "replaying applied request");
            return replay_view(request, &locked);
        }

        // (3) acquire locks, healing contested ones once on the live path
        let locked = match self.locks.acquire(&record.id, &request.keys()).await {
            Ok(locked) => locked,
            Err(TxError::Conflict { conflicts }) if mode == ApplyMode::Live => {
                self.heal_conflicts(&conflicts).await?;
                self.locks.acquire(&record.id, &request.keys()).await?
            }
            Err(e) => return Err(e),
        };

        // (4) write-ahead before-images
        let backups = items_to_backup(request, &locked);
        let backed_keys: Vec<ItemKey> = backups.iter().map(|(key, _)| key.clone()).collect();
        self.images.add(&tv, backups).await?;

        // (5) the record may have been completed by another actor
        // between append and here; mutating now would corrupt it
        if mode == ApplyMode::Live {
            let fresh = self.records.get(&record.id, true).await?;
            if fresh.state != TxState::Active {
                self.undo_request(&tv, &locked, &backed_keys).await;
                return Err(terminal_error(&fresh));
            }
        }

        // (6) apply mutations
        let outcomes = self.locks.apply(&record.id, request, &locked).await?;

        // (7) mark fully applied
        self.applied.mark(&tv).await?;
        debug!(
            target: "keyspan::txn",
            tx = %record.id,
            request = request.id,
            "request applied"
        );
        Ok(outcomes)
    }

    /// Best-effort undo of locks and images taken for a request whose
    /// transaction went terminal mid-pipeline. Anything left behind is
    /// released again by the terminal completion, which covers every key
    /// in the log.
    async fn undo_request(&self, tv: &TxVersion, locked: &LockedItems, backed: &[ItemKey]) {
        for (key, held) in locked {
            if held.state.applied {
                // An earlier request's mutation; completion owns its fate.
                continue;
            }
            // Guarded dispositions: if a racing completion drains the
            // mutation in the meantime, the item is its to settle, and
            // a refused release (Ok(false)) leaves it alone.
            let disposition = if held.state.transient {
                Disposition::DeleteUnapplied
            } else {
                Disposition::UnlockUnapplied
            };
            if let Err(e) = self.locks.release(&tv.tx_id, key, disposition).await {
                warn!(
                    target: "keyspan::txn",
                    tx = %tv.tx_id,
                    item = %key,
                    error = %e,
                    "undo of an interrupted request left a lock behind"
                );
            }
        }
        let plan: Vec<(TxVersion, ItemKey)> = backed
            .iter()
            .map(|key| (tv.clone(), key.clone()))
            .collect();
        if let Err(e) = self.images.delete_all(&plan).await {
            warn!(
                target: "keyspan::txn",
                tx = %tv.tx_id,
                error = %e,
                "undo of an interrupted request left images behind"
            );
        }
    }

    /// Drive a Committing (or already Committed) transaction to the end.
    /// Idempotent; any number of actors may run it concurrently.
    async fn complete_commit(&self, record: &TxRecord) -> TxResult<()> {
        for request in &record.requests {
            let tv = TxVersion::new(record.id.clone(), request.id);
            if self.applied.contains(&tv).await? {
                continue;
            }
            self.apply_request(record, request, ApplyMode::Drain).await?;
        }
        self.release_all(record, false).await?;
        self.images.delete_all(&record.image_plan()).await?;
        let finished = self.finalize_state(record, TxState::Committed).await?;
        self.applied.forget(&record.versions()).await?;
        if finished {
            self.committed.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "keyspan::txn",
                tx = %record.id,
                requests = record.requests.len(),
                "transaction committed"
            );
        }
        Ok(())
    }

    /// Drive a RollingBack (or already RolledBack) transaction to the
    /// end. Idempotent like commit completion.
    async fn complete_rollback(&self, record: &TxRecord) -> TxResult<()> {
        self.release_all(record, true).await?;
        self.images.delete_all(&record.image_plan()).await?;
        let finished = self.finalize_state(record, TxState::RolledBack).await?;
        self.applied.forget(&record.versions()).await?;
        if finished {
            self.rolled_back.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "keyspan::txn",
                tx = %record.id,
                requests = record.requests.len(),
                "transaction rolled back"
            );
        }
        Ok(())
    }

    /// Release every item the record's log touches, committing or
    /// restoring per item. Items already released are skipped.
    ///
    /// The state each disposition was decided from may be stale by the
    /// time the release write runs; the guarded dispositions fail in
    /// that case, and the item is read and decided again. An apply that
    /// lands mid-release is seen on the next pass as applied and gets
    /// restored rather than unlocked in place.
    async fn release_all(&self, record: &TxRecord, rollback: bool) -> TxResult<()> {
        for (key, action) in record.key_actions() {
            let mut attempts = 0;
            loop {
                let raw = match self.locks.current(&key).await? {
                    Some(raw) => raw,
                    None => break,
                };
                let state = lock_state(&raw);
                if !state.locked_by(&record.id) {
                    break;
                }
                let image = if rollback && state.applied && !state.transient {
                    match record.writing_request(&key) {
                        Some(rid) => {
                            self.images
                                .get(&TxVersion::new(record.id.clone(), rid), &key)
                                .await?
                        }
                        None => None,
                    }
                } else {
                    None
                };
                let disposition = release_disposition(&key, action, &state, rollback, image)?;
                if self.locks.release(&record.id, &key, disposition).await? {
                    break;
                }
                attempts += 1;
                if attempts >= RELEASE_ATTEMPTS {
                    return Err(TxError::Assertion(format!(
                        "item {} kept changing while {} was releasing it",
                        key, record.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Final CAS into a terminal state. Returns whether this call made
    /// the transition; a racing completer that already did is fine, any
    /// other state is an invariant violation.
    async fn finalize_state(&self, record: &TxRecord, terminal: TxState) -> TxResult<bool> {
        if record.state == terminal {
            return Ok(false);
        }
        match self.records.set_state(record, terminal).await {
            Ok(_) => Ok(true),
            Err(TxError::VersionConflict { .. }) => {
                match self.records.get(&record.id, true).await {
                    Ok(latest) if latest.state == terminal => Ok(false),
                    Ok(latest) => Err(TxError::Assertion(format!(
                        "transaction {} became {} while being completed as {}",
                        record.id, latest.state, terminal
                    ))),
                    // Completed and already swept away.
                    Err(TxError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve foreign locks found during acquisition.
    ///
    /// Per distinct owner: a live owner is left alone, a stale one is
    /// driven to completion in whichever direction its record decided,
    /// and a lock with no record at all is stripped in place.
    ///
    /// Completing a commit drains requests back through the apply
    /// pipeline, which heals again on the live path; the returned future
    /// is boxed to keep that recursion finite-sized.
    pub(crate) fn heal_conflicts<'a>(
        &'a self,
        conflicts: &'a [LockConflict],
    ) -> BoxFuture<'a, TxResult<()>> {
        Box::pin(async move {
            let mut by_owner: BTreeMap<TxId, Vec<&LockConflict>> = BTreeMap::new();
            for conflict in conflicts {
                by_owner
                    .entry(conflict.owner.clone())
                    .or_default()
                    .push(conflict);
            }
            let now = Utc::now();
            for (owner, held) in by_owner {
                let record = match self.records.get(&owner, true).await {
                    Ok(record) => Some(record),
                    Err(TxError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                };
                let action = healing::decide(record.as_ref(), self.config.staleness, now);
                debug!(
                    target: "keyspan::lock",
                    holder = %owner,
                    action = ?action,
                    items = held.len(),
                    "deciding fate of contested lock"
                );
                match (action, record) {
                    (HealAction::LeaveAlone, _) => {}
                    (HealAction::CompleteCommit, Some(record)) => {
                        warn!(
                            target: "keyspan::lock",
                            tx = %owner,
                            "completing a stalled commit to free its locks"
                        );
                        self.complete_commit(&record).await?;
                        self.conflicts_healed.fetch_add(1, Ordering::Relaxed);
                    }
                    (HealAction::CompleteRollback, Some(record)) => {
                        let record = if record.state == TxState::Active {
                            match self.records.set_state(&record, TxState::RollingBack).await {
                                Ok(rolling) => rolling,
                                // The owner moved under us; the caller's
                                // retry will observe whatever it became.
                                Err(TxError::VersionConflict { .. }) => continue,
                                Err(e) => return Err(e),
                            }
                        } else {
                            record
                        };
                        warn!(
                            target: "keyspan::lock",
                            tx = %owner,
                            "rolling back a stalled transaction to free its locks"
                        );
                        self.complete_rollback(&record).await?;
                        self.conflicts_healed.fetch_add(1, Ordering::Relaxed);
                    }
                    (HealAction::ReleaseOrphanedLock, _) => {
                        warn!(
                            target: "keyspan::lock",
                            holder = %owner,
                            items = held.len(),
                            "releasing locks of a transaction with no record"
                        );
                        for conflict in held {
                            self.locks.force_release(conflict).await?;
                        }
                        self.conflicts_healed.fetch_add(1, Ordering::Relaxed);
                    }
                    // decide only completes owners whose record it saw.
                    (HealAction::CompleteCommit | HealAction::CompleteRollback, None) => {
                        return Err(TxError::Assertion(
                            "healing decided to complete a transaction without a record".into(),
                        ))
                    }
                }
            }
            Ok(())
        })
    }
}

/// A borrowed view of one transaction, with operation sugar.
///
/// Dropping the handle does nothing; an unfinished transaction stays
/// Active until committed, rolled back or swept.
pub struct TxHandle<'a> {
    coordinator: &'a TxCoordinator,
    id: TxId,
}

impl TxHandle<'_> {
    /// This transaction's id.
    pub fn id(&self) -> &TxId {
        &self.id
    }

    /// Run a group of operations as one request.
    pub async fn run(
        &self,
        requests: Vec<ItemRequest>,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        self.coordinator.execute(&self.id, requests).await
    }

    /// Read one item under this transaction's lock.
    pub async fn get(&self, key: ItemKey) -> TxResult<Option<ItemRecord>> {
        single(self.run(vec![ItemRequest::Get { key }]).await?)
    }

    /// Put a whole item. Returns the item as applied.
    pub async fn put(
        &self,
        table: impl Into<String>,
        item: keyspan_core::AttrMap,
    ) -> TxResult<Option<ItemRecord>> {
        single(
            self.run(vec![ItemRequest::Put {
                table: table.into(),
                item,
            }])
            .await?,
        )
    }

    /// Edit one item's attributes. Returns the item after the edit.
    pub async fn update(
        &self,
        key: ItemKey,
        ops: Vec<UpdateOp>,
    ) -> TxResult<Option<ItemRecord>> {
        single(self.run(vec![ItemRequest::Update { key, ops }]).await?)
    }

    /// Delete one item at commit. Returns the value being deleted.
    pub async fn delete(&self, key: ItemKey) -> TxResult<Option<ItemRecord>> {
        single(self.run(vec![ItemRequest::Delete { key }]).await?)
    }

    /// Assert a condition over one item without writing it.
    pub async fn check(&self, key: ItemKey, condition: Condition) -> TxResult<()> {
        self.run(vec![ItemRequest::ConditionCheck { key, condition }])
            .await?;
        Ok(())
    }

    /// Commit this transaction.
    pub async fn commit(self) -> TxResult<()> {
        self.coordinator.commit(&self.id).await
    }

    /// Roll this transaction back.
    pub async fn rollback(self) -> TxResult<()> {
        self.coordinator.rollback(&self.id).await
    }
}

fn ensure_active(record: &TxRecord) -> TxResult<()> {
    if record.state == TxState::Active {
        Ok(())
    } else {
        Err(terminal_error(record))
    }
}

fn terminal_error(record: &TxRecord) -> TxError {
    match record.state {
        TxState::Committing | TxState::Committed => TxError::AlreadyCommitted(record.id.clone()),
        _ => TxError::AlreadyRolledBack(record.id.clone()),
    }
}

/// Answer a replayed request from its held locks, writing nothing.
fn replay_view(request: &TxRequest, locked: &LockedItems) -> TxResult<Vec<Option<ItemRecord>>> {
    request
        .ops
        .iter()
        .map(|op| {
            locked
                .get(op.key())
                .map(|held| held.visible())
                .ok_or_else(|| {
                    TxError::Assertion(format!(
                        "replay of request {} lost the lock on {}",
                        request.id,
                        op.key()
                    ))
                })
        })
        .collect()
}

fn single(mut outcomes: Vec<Option<ItemRecord>>) -> TxResult<Option<ItemRecord>> {
    match outcomes.pop() {
        Some(outcome) if outcomes.is_empty() => Ok(outcome),
        _ => Err(TxError::Assertion(
            "single-op request produced a different op count".into(),
        )),
    }
}
