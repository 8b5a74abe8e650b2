//! Isolated reads outside a transaction
//!
//! Two read services share one interface. Uncommitted is a plain read
//! with the bookkeeping attributes stripped. Committed chases the lock
//! of a contested item back to its owning transaction and decides from
//! the owner's state whether the caller may see the current value or
//! must get the saved before-image.
//!
//! Neither service takes locks, so neither promises repeatable reads.
//! Reads inside a transaction go through the coordinator instead.

use async_trait::async_trait;
use keyspan_core::{
    lock_state, visible_record, AttrMap, ItemKey, ItemRecord, ItemTxState, SharedStore, TxError,
    TxResult, TxVersion,
};
use keyspan_txn::images::ItemImageStore;
use keyspan_txn::record::{TxRecord, TxState};
use keyspan_txn::record_store::TxRecordStore;
use tracing::debug;

/// What a reader outside a transaction is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Current stored values, applied-but-uncommitted mutations included.
    Uncommitted,
    /// Only values whose owning transaction decided to commit.
    Committed,
}

/// Point reads at one isolation level.
#[async_trait]
pub trait IsolatedReads: Send + Sync + 'static {
    /// Read one item.
    async fn get_item(&self, key: &ItemKey, consistent: bool) -> TxResult<Option<ItemRecord>>;

    /// Read many items with no atomicity across them. Results are
    /// positional.
    async fn batch_get_items(
        &self,
        keys: &[ItemKey],
        consistent: bool,
    ) -> TxResult<Vec<Option<ItemRecord>>>;

    /// Read many items from one consistent point in time. Results are
    /// positional. Lock resolution happens after the snapshot, so two
    /// contested items may resolve against different owner states.
    async fn transact_get_items(&self, keys: &[ItemKey]) -> TxResult<Vec<Option<ItemRecord>>>;
}

/// Read-uncommitted service: stored values with the bookkeeping
/// stripped. A placeholder that was never written into existence reads
/// as absent.
pub struct UncommittedReads {
    store: SharedStore,
}

impl UncommittedReads {
    /// Create a read-uncommitted service over a store.
    pub fn new(store: SharedStore) -> Self {
        UncommittedReads { store }
    }
}

fn uncommitted_view(raw: &AttrMap) -> Option<ItemRecord> {
    let state = lock_state(raw);
    if state.transient && !state.applied {
        return None;
    }
    Some(visible_record(raw))
}

#[async_trait]
impl IsolatedReads for UncommittedReads {
    async fn get_item(&self, key: &ItemKey, consistent: bool) -> TxResult<Option<ItemRecord>> {
        let raw = self.store.get_item(key, consistent).await?;
        Ok(raw.as_ref().and_then(uncommitted_view))
    }

    async fn batch_get_items(
        &self,
        keys: &[ItemKey],
        consistent: bool,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        let raws = self.store.batch_get(keys, consistent).await?;
        Ok(raws
            .iter()
            .map(|raw| raw.as_ref().and_then(uncommitted_view))
            .collect())
    }

    async fn transact_get_items(&self, keys: &[ItemKey]) -> TxResult<Vec<Option<ItemRecord>>> {
        let raws = self.store.transact_get(keys).await?;
        Ok(raws
            .iter()
            .map(|raw| raw.as_ref().and_then(uncommitted_view))
            .collect())
    }
}

/// Read-committed service.
///
/// An unlocked item is its own committed value. A locked item is read
/// through its owner: owners that decided to commit expose the current
/// value, everyone else exposes the pre-transaction value, which is
/// either the item itself (mutation not yet applied) or the saved
/// before-image.
pub struct CommittedReads {
    store: SharedStore,
    records: TxRecordStore,
    images: ItemImageStore,
}

impl CommittedReads {
    /// Create a read-committed service sharing the engine's stores.
    pub fn new(store: SharedStore, records: TxRecordStore, images: ItemImageStore) -> Self {
        CommittedReads {
            store,
            records,
            images,
        }
    }

    async fn resolve(&self, key: &ItemKey, consistent: bool) -> TxResult<Option<ItemRecord>> {
        let mut reread = false;
        loop {
            let raw = match self.store.get_item(key, consistent).await? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let state = lock_state(&raw);
            let owner = match &state.owner {
                None => return Ok(Some(visible_record(&raw))),
                Some(owner) => owner.clone(),
            };
            return match self.records.get(&owner, true).await {
                Ok(record) => self.view_under(&record, &raw, &state, key).await,
                Err(TxError::NotFound(_)) if !reread => {
                    // The owner likely finished and was swept between our
                    // two reads; the item should be unlocked now.
                    debug!(
                        target: "keyspan::txn",
                        item = %key,
                        holder = %owner,
                        "lock owner has no record, re-reading item"
                    );
                    reread = true;
                    continue;
                }
                Err(TxError::NotFound(_)) => orphan_view(&raw, &state, key),
                Err(e) => Err(e),
            };
        }
    }

    /// Committed view of a locked item given its owner's record.
    async fn view_under(
        &self,
        record: &TxRecord,
        raw: &AttrMap,
        state: &ItemTxState,
        key: &ItemKey,
    ) -> TxResult<Option<ItemRecord>> {
        if matches!(record.state, TxState::Committing | TxState::Committed) {
            if state.transient && !state.applied {
                return Ok(None);
            }
            return Ok(Some(visible_record(raw)));
        }
        if state.transient {
            // The item did not exist before the owner created it.
            return Ok(None);
        }
        if !state.applied {
            // The mutation never landed; the item is its own pre-image.
            return Ok(Some(visible_record(raw)));
        }
        let request_id = record.writing_request(key).ok_or_else(|| {
            TxError::Assertion(format!(
                "item {} carries an applied mutation but transaction {} never wrote it",
                key, record.id
            ))
        })?;
        let tv = TxVersion::new(record.id.clone(), request_id);
        match self.images.get(&tv, key).await? {
            Some(image) => Ok(Some(image)),
            None => Err(TxError::Assertion(format!(
                "no before-image for applied item {} of transaction {}",
                key, record.id
            ))),
        }
    }
}

/// View of an item still locked by an owner with no record.
///
/// Unapplied locks carry the original value in place; applied ones with
/// no record to consult are corruption.
fn orphan_view(raw: &AttrMap, state: &ItemTxState, key: &ItemKey) -> TxResult<Option<ItemRecord>> {
    if state.applied {
        return Err(TxError::Assertion(format!(
            "item {} carries an applied mutation of a transaction with no record",
            key
        )));
    }
    if state.transient {
        return Ok(None);
    }
    Ok(Some(visible_record(raw)))
}

#[async_trait]
impl IsolatedReads for CommittedReads {
    async fn get_item(&self, key: &ItemKey, consistent: bool) -> TxResult<Option<ItemRecord>> {
        self.resolve(key, consistent).await
    }

    async fn batch_get_items(
        &self,
        keys: &[ItemKey],
        consistent: bool,
    ) -> TxResult<Vec<Option<ItemRecord>>> {
        let raws = self.store.batch_get(keys, consistent).await?;
        let mut out = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(raws) {
            out.push(match raw {
                None => None,
                // Unlocked items need no owner lookup.
                Some(raw) if !lock_state(&raw).is_locked() => Some(visible_record(&raw)),
                Some(_) => self.resolve(key, consistent).await?,
            });
        }
        Ok(out)
    }

    async fn transact_get_items(&self, keys: &[ItemKey]) -> TxResult<Vec<Option<ItemRecord>>> {
        let raws = self.store.transact_get(keys).await?;
        let mut out = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(raws) {
            out.push(match raw {
                None => None,
                Some(raw) if !lock_state(&raw).is_locked() => Some(visible_record(&raw)),
                Some(_) => self.resolve(key, true).await?,
            });
        }
        Ok(out)
    }
}
