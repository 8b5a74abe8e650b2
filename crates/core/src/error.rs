//! Error types
//!
//! Two layers, two enums:
//! - [`StoreError`]: what the key-value store itself can report
//! - [`TxError`]: what the transaction engine reports to callers
//!
//! `StoreError` converts into `TxError` via `#[from]`, so store failures
//! propagate through engine code with `?`.

use crate::item_state::ItemTxState;
use crate::key::ItemKey;
use crate::types::{RequestId, TxId};
use crate::value::{AttrMap, ItemRecord};
use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result alias for transaction operations.
pub type TxResult<T> = std::result::Result<T, TxError>;

/// One failed conditional check inside a store write.
///
/// Carries the item's current state so callers can react without a
/// follow-up read: lock acquisition inspects `current` to find the
/// competing owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionFailure {
    /// Item whose condition failed
    pub key: ItemKey,
    /// The item as it was when the check ran, `None` if it did not exist
    pub current: Option<AttrMap>,
}

/// Errors reported by a key-value store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The named table has not been created.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A single conditional write did not pass its condition.
    #[error("conditional check failed on {}", .0.key)]
    ConditionFailed(ConditionFailure),

    /// An atomic multi-item write was canceled because one or more
    /// conditions did not hold. No write in the batch was applied.
    #[error("atomic write canceled, {} condition failure(s)", failures.len())]
    WriteCanceled {
        /// Every op whose condition failed, with current item state
        failures: Vec<ConditionFailure>,
    },

    /// An atomic call was given more items than the store can handle in
    /// one native operation.
    #[error("atomic batch of {count} items exceeds store limit {limit}")]
    BatchTooLarge {
        /// Items requested
        count: usize,
        /// Store's native ceiling
        limit: usize,
    },

    /// An item or call violated the store's shape rules (missing key
    /// attributes, duplicate keys in one batch, and so on).
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl StoreError {
    /// The condition failures carried by this error, if any.
    pub fn condition_failures(&self) -> &[ConditionFailure] {
        match self {
            StoreError::ConditionFailed(failure) => std::slice::from_ref(failure),
            StoreError::WriteCanceled { failures } => failures,
            _ => &[],
        }
    }
}

/// One item found locked by some other transaction.
#[derive(Debug, Clone)]
pub struct LockConflict {
    /// The contested item
    pub key: ItemKey,
    /// Transaction holding the lock
    pub owner: TxId,
    /// Caller-visible record at the time of the conflict
    pub record: ItemRecord,
    /// Full decoded lock state
    pub state: ItemTxState,
}

/// Errors reported by the transaction engine.
#[derive(Error, Debug)]
pub enum TxError {
    /// No transaction record exists under the given id. Usually means the
    /// transaction finished long ago and house-keeping removed it.
    #[error("transaction not found: {0}")]
    NotFound(TxId),

    /// The transaction already committed; it cannot accept new work or be
    /// rolled back.
    #[error("transaction {0} is already committed")]
    AlreadyCommitted(TxId),

    /// The transaction already rolled back; it cannot accept new work or
    /// be committed.
    #[error("transaction {0} is already rolled back")]
    AlreadyRolledBack(TxId),

    /// One or more items are locked by other transactions.
    #[error("{} item(s) locked by other transactions", conflicts.len())]
    Conflict {
        /// Every contested item with its current owner
        conflicts: Vec<LockConflict>,
    },

    /// A request tried to write an item this transaction already wrote.
    #[error("item {key} was already written by request {request_id} of this transaction")]
    DuplicateRequest {
        /// The item written twice
        key: ItemKey,
        /// The earlier request that wrote it
        request_id: RequestId,
    },

    /// The transaction record changed underneath a compare-and-set.
    /// Callers re-read the record and retry.
    #[error("transaction record for {id} changed, expected version {expected}")]
    VersionConflict {
        /// Transaction whose record moved
        id: TxId,
        /// Version the caller expected
        expected: u64,
    },

    /// The request itself is invalid and will never succeed as written.
    #[error("invalid request: {0}")]
    Validation(String),

    /// An internal invariant did not hold. Indicates either corruption or
    /// a bug, never a caller mistake.
    #[error("invariant violated: {0}")]
    Assertion(String),

    /// A store-level failure that is not part of the locking protocol.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TxError {
    /// Whether this error reports a transaction already in a terminal
    /// state. Callers driving a transaction toward that same state treat
    /// these as success.
    pub fn is_terminal_state(&self) -> bool {
        matches!(
            self,
            TxError::AlreadyCommitted(_) | TxError::AlreadyRolledBack(_)
        )
    }

    /// Whether retrying the same call can succeed after other transactions
    /// make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxError::Conflict { .. } | TxError::VersionConflict { .. }
        )
    }
}
