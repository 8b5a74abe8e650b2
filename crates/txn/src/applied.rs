//! Applied-request tracking
//!
//! Records which (transaction, request) pairs have had every mutation
//! applied. The apply pipeline consults this set to skip straight to
//! release when a request is replayed, and commit completion uses it to
//! tell requests that still need draining from requests already done.
//!
//! The set is an optimization, not a source of truth: losing an entry
//! only costs a redundant (and idempotent) apply pass. That is why the
//! default implementation is a process-local set and the store-backed
//! one is optional.

use async_trait::async_trait;
use keyspan_core::{
    AttrMap, AttrValue, Condition, ItemKey, SharedStore, TxResult, TxVersion,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which requests have fully applied.
#[async_trait]
pub trait AppliedRequests: Send + Sync + 'static {
    /// Record that every mutation of `tv` has landed.
    async fn mark(&self, tv: &TxVersion) -> TxResult<()>;

    /// Whether `tv` is known to have fully applied.
    ///
    /// A `false` from a lossy implementation is fine; callers fall back
    /// to re-applying, which the item-level guards make idempotent.
    async fn contains(&self, tv: &TxVersion) -> TxResult<bool>;

    /// Drop entries for a finished transaction.
    async fn forget(&self, tvs: &[TxVersion]) -> TxResult<()>;
}

/// Shared handle to an applied-request tracker.
pub type SharedAppliedSet = Arc<dyn AppliedRequests>;

/// Process-local tracker. Entries die with the process, which is safe:
/// a restarted coordinator just re-applies idempotently.
#[derive(Default)]
pub struct InMemoryAppliedSet {
    entries: Mutex<HashSet<TxVersion>>,
}

impl InMemoryAppliedSet {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppliedRequests for InMemoryAppliedSet {
    async fn mark(&self, tv: &TxVersion) -> TxResult<()> {
        self.entries.lock().insert(tv.clone());
        Ok(())
    }

    async fn contains(&self, tv: &TxVersion) -> TxResult<bool> {
        Ok(self.entries.lock().contains(tv))
    }

    async fn forget(&self, tvs: &[TxVersion]) -> TxResult<()> {
        let mut entries = self.entries.lock();
        for tv in tvs {
            entries.remove(tv);
        }
        Ok(())
    }
}

/// Pk attribute of marker rows.
pub const ATTR_MARKER: &str = "_marker";

/// Store-backed tracker: one marker row per applied request, visible to
/// every coordinator sharing the table.
#[derive(Clone)]
pub struct StoreAppliedSet {
    store: SharedStore,
    table: String,
}

impl StoreAppliedSet {
    /// Create a tracker writing marker rows to `table`.
    pub fn new(store: SharedStore, table: impl Into<String>) -> Self {
        StoreAppliedSet {
            store,
            table: table.into(),
        }
    }

    fn marker_key(&self, tv: &TxVersion) -> ItemKey {
        ItemKey::single(&self.table, ATTR_MARKER, tv.to_string())
    }
}

#[async_trait]
impl AppliedRequests for StoreAppliedSet {
    async fn mark(&self, tv: &TxVersion) -> TxResult<()> {
        let mut row = AttrMap::new();
        row.insert(ATTR_MARKER.into(), AttrValue::Str(tv.to_string()));
        self.store
            .put_item(&self.table, row, Condition::none())
            .await?;
        Ok(())
    }

    async fn contains(&self, tv: &TxVersion) -> TxResult<bool> {
        Ok(self
            .store
            .get_item(&self.marker_key(tv), true)
            .await?
            .is_some())
    }

    async fn forget(&self, tvs: &[TxVersion]) -> TxResult<()> {
        for tv in tvs {
            self.store
                .delete_item(&self.marker_key(tv), Condition::none())
                .await?;
        }
        Ok(())
    }
}
