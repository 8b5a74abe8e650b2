//! Durable access to transaction records
//!
//! Every write goes through one compare-and-set on the record's
//! `_version` attribute. Losing the race surfaces as
//! [`TxError::VersionConflict`]; callers re-read and retry. This is the
//! only concurrency control the record itself needs: items have their own
//! locks.

use crate::record::{TxRecord, TxState, ATTR_TX_ID, ATTR_TX_VERSION};
use crate::request::ItemOp;
use chrono::Utc;
use keyspan_core::{
    Condition, ItemKey, SharedStore, StoreError, TxError, TxId, TxResult,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Store-backed home of transaction records.
#[derive(Clone)]
pub struct TxRecordStore {
    store: SharedStore,
    table: String,
}

impl TxRecordStore {
    /// Create a record store writing into `table`.
    pub fn new(store: SharedStore, table: impl Into<String>) -> Self {
        TxRecordStore {
            store,
            table: table.into(),
        }
    }

    /// Table holding the records.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn key(&self, id: &TxId) -> ItemKey {
        ItemKey::single(&self.table, ATTR_TX_ID, id.as_str())
    }

    /// Persist a brand-new record. Fails if the id is already taken.
    pub async fn insert(&self, record: &TxRecord) -> TxResult<()> {
        let item = record.encode()?;
        match self
            .store
            .put_item(&self.table, item, Condition::item_not_exists())
            .await
        {
            Ok(()) => {
                debug!(target: "keyspan::txn", tx = %record.id, "created transaction record");
                Ok(())
            }
            Err(StoreError::ConditionFailed(_)) => Err(TxError::Validation(format!(
                "transaction {} already exists",
                record.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a record. [`TxError::NotFound`] if no record exists.
    pub async fn get(&self, id: &TxId, consistent: bool) -> TxResult<TxRecord> {
        let item = self
            .store
            .get_item(&self.key(id), consistent)
            .await?
            .ok_or_else(|| TxError::NotFound(id.clone()))?;
        TxRecord::decode(&item)
    }

    /// Compare-and-set write of a modified record.
    ///
    /// `record.version` must be the version the caller read; the stored
    /// record gets `version + 1` and a fresh `last_update`. Returns the
    /// record as stored.
    pub async fn update(&self, record: &TxRecord) -> TxResult<TxRecord> {
        let mut next = record.clone();
        next.version = record.version + 1;
        next.last_update = Utc::now();
        let expected = Condition::attr_eq(ATTR_TX_VERSION, record.version as i64);
        match self.store.put_item(&self.table, next.encode()?, expected).await {
            Ok(()) => Ok(next),
            Err(StoreError::ConditionFailed(failure)) => match failure.current {
                None => Err(TxError::NotFound(record.id.clone())),
                Some(_) => Err(TxError::VersionConflict {
                    id: record.id.clone(),
                    expected: record.version,
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Append one request to the log, assigning its id. Compare-and-set
    /// like [`TxRecordStore::update`].
    pub async fn append_request(
        &self,
        record: &TxRecord,
        ops: Vec<ItemOp>,
    ) -> TxResult<TxRecord> {
        let mut next = record.clone();
        next.requests.push(crate::request::TxRequest {
            id: record.next_request_id(),
            ops,
        });
        self.update(&next).await
    }

    /// Move a record along the state machine. Illegal transitions are
    /// assertion errors, not races: callers check state before calling.
    pub async fn set_state(&self, record: &TxRecord, to: TxState) -> TxResult<TxRecord> {
        if !record.state.can_transition_to(to) {
            return Err(TxError::Assertion(format!(
                "illegal transition {} -> {} for transaction {}",
                record.state, to, record.id
            )));
        }
        let mut next = record.clone();
        next.state = to;
        let stored = self.update(&next).await?;
        debug!(
            target: "keyspan::txn",
            tx = %record.id,
            from = %record.state,
            to = %to,
            "transaction state change"
        );
        Ok(stored)
    }

    /// Every decodable record, up to `limit`. Undecodable rows are
    /// skipped with a warning so one bad record cannot stall
    /// house-keeping.
    pub async fn list(&self, limit: Option<usize>) -> TxResult<Vec<TxRecord>> {
        let items = self.store.scan_table(&self.table, limit).await?;
        Ok(items
            .iter()
            .filter_map(|item| match TxRecord::decode(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        target: "keyspan::txn",
                        error = %e,
                        "skipping undecodable transaction record"
                    );
                    None
                }
            })
            .collect())
    }

    /// Delete a terminal record once it has been idle for `min_age`.
    ///
    /// Returns whether this call deleted it. Racing deleters are safe:
    /// exactly one observes `true`. Calling this on a live transaction is
    /// a caller bug and fails validation.
    pub async fn try_remove(&self, id: &TxId, min_age: Duration) -> TxResult<bool> {
        let record = match self.get(id, true).await {
            Ok(record) => record,
            Err(TxError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !record.state.is_terminal() {
            return Err(TxError::Validation(format!(
                "transaction {} is {} and cannot be removed",
                id, record.state
            )));
        }
        if !record.is_stale(min_age, Utc::now()) {
            return Ok(false);
        }
        let unchanged = Condition::attr_eq(ATTR_TX_VERSION, record.version as i64);
        match self.store.delete_item(&self.key(id), unchanged).await {
            Ok(_) => {
                debug!(target: "keyspan::txn", tx = %id, "removed finished transaction record");
                Ok(true)
            }
            Err(StoreError::ConditionFailed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
