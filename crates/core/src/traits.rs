//! Store contract
//!
//! [`KeyValueStore`] is the only interface the transaction engine has to
//! the underlying store. Everything the engine does - locking, backups,
//! replay markers, healing - is expressed through these calls, so any
//! store that honors this contract can sit underneath the engine.
//!
//! ## Contract notes
//!
//! - Single-item writes are atomic and conditional: the condition is
//!   evaluated against the current item and the write happens only if it
//!   holds. On failure the store reports the item's current state.
//! - `transact_write` is all-or-nothing across at most
//!   [`StoreLimits::transact_write_items`] items. It is the store's only
//!   native multi-item atomicity, and the ceiling is why the engine
//!   exists.
//! - `consistent: true` asks for read-your-writes consistency. A store
//!   with no replication may ignore the flag.

use crate::error::StoreResult;
use crate::key::ItemKey;
use crate::ops::{Condition, UpdateOp, WriteOp};
use crate::value::AttrMap;
use async_trait::async_trait;
use std::sync::Arc;

/// Native batch ceilings of a store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Most items one `transact_write` can carry
    pub transact_write_items: usize,
    /// Most items one `transact_get` can carry
    pub transact_get_items: usize,
    /// Most items one `batch_get` can carry
    pub batch_get_items: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        StoreLimits {
            transact_write_items: 100,
            transact_get_items: 100,
            batch_get_items: 100,
        }
    }
}

/// A table-structured key-value store with conditional writes and a
/// bounded atomic multi-item write.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read one item. Returns `None` if it does not exist.
    async fn get_item(&self, key: &ItemKey, consistent: bool) -> StoreResult<Option<AttrMap>>;

    /// Write a whole item if `condition` holds against its current state.
    /// Creates the item if it does not exist.
    async fn put_item(&self, table: &str, item: AttrMap, condition: Condition) -> StoreResult<()>;

    /// Edit attributes of one item if `condition` holds. Creates the item
    /// if it does not exist (upsert). Returns the item after the edit.
    async fn update_item(
        &self,
        key: &ItemKey,
        ops: Vec<UpdateOp>,
        condition: Condition,
    ) -> StoreResult<AttrMap>;

    /// Delete one item if `condition` holds. Returns the item as it was,
    /// `None` if it did not exist.
    async fn delete_item(&self, key: &ItemKey, condition: Condition)
        -> StoreResult<Option<AttrMap>>;

    /// Apply every write or none, atomically.
    ///
    /// Fails with [`StoreError::WriteCanceled`] if any condition does not
    /// hold, [`StoreError::BatchTooLarge`] over the limit, and
    /// [`StoreError::Malformed`] if two ops address the same item.
    ///
    /// [`StoreError::WriteCanceled`]: crate::error::StoreError::WriteCanceled
    /// [`StoreError::BatchTooLarge`]: crate::error::StoreError::BatchTooLarge
    /// [`StoreError::Malformed`]: crate::error::StoreError::Malformed
    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Read up to [`StoreLimits::transact_get_items`] items from one
    /// consistent point in time. Results are positional.
    async fn transact_get(&self, keys: &[ItemKey]) -> StoreResult<Vec<Option<AttrMap>>>;

    /// Read up to [`StoreLimits::batch_get_items`] items with no atomicity
    /// across them. Results are positional.
    async fn batch_get(
        &self,
        keys: &[ItemKey],
        consistent: bool,
    ) -> StoreResult<Vec<Option<AttrMap>>>;

    /// All items of a table in key order, up to `limit`. Used by
    /// house-keeping to enumerate transaction records.
    async fn scan_table(&self, table: &str, limit: Option<usize>) -> StoreResult<Vec<AttrMap>>;

    /// The primary-key attribute names of a table, in schema order.
    async fn key_schema(&self, table: &str) -> StoreResult<Vec<String>>;

    /// This store's native batch ceilings.
    fn limits(&self) -> StoreLimits;
}

/// Shared handle to a store, as held by every engine component.
pub type SharedStore = Arc<dyn KeyValueStore>;
