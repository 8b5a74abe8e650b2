//! Keyspan - multi-item ACID transactions over a bounded-atomic KV store
//!
//! Keyspan layers multi-item, multi-request transactions on top of a
//! key-value store whose only native atomicity is a conditional
//! multi-item write bounded to ~100 items. Locks live inside the items
//! themselves as reserved attributes; crashed transactions are healed
//! cooperatively by whoever runs into their locks.
//!
//! # Quick Start
//!
//! ```no_run
//! use keyspan::{MemoryStore, TxCoordinator, ItemKey, AttrValue, UpdateOp};
//! use std::sync::Arc;
//!
//! # async fn demo() -> keyspan::TxResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! store.create_table("accounts", &["id"])?;
//! let txns = TxCoordinator::new(store);
//!
//! let tx = txns.begin().await?;
//! tx.update(
//!     ItemKey::single("accounts", "id", "alice"),
//!     vec![UpdateOp::Set("balance".into(), AttrValue::Int(90))],
//! )
//! .await?;
//! tx.update(
//!     ItemKey::single("accounts", "id", "bob"),
//!     vec![UpdateOp::Set("balance".into(), AttrValue::Int(110))],
//! )
//! .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`keyspan_core`]: the data model, store contract and error taxonomy
//! - [`keyspan_store`]: `MemoryStore`, the in-memory reference store
//! - [`keyspan_txn`]: the protocol stores (records, locks, images,
//!   applied-set, healing)
//! - [`keyspan_engine`]: the coordinator, quick path, isolated reads and
//!   the house-keeping sweeper

pub use keyspan_core::{
    is_reserved_attr, lock_state, split_item, visible_record, AttrCheck, AttrMap, AttrValue,
    Condition, ConditionFailure, ItemKey, ItemRecord, ItemTxState, KeyAttr, KeyValueStore,
    LockConflict, RequestId, SharedStore, StoreError, StoreLimits, StoreResult, TxError, TxId,
    TxResult, TxVersion, UpdateOp, WriteOp, ATTR_APPLIED, ATTR_LOCK_OWNER, ATTR_TRANSIENT,
    RESERVED_PREFIX,
};
pub use keyspan_engine::{
    CommittedReads, CoordinatorStats, EngineConfig, IsolatedReads, IsolationLevel, RetryConfig,
    SweepAction, SweepOutcome, Sweeper, SweeperHandle, TxCoordinator, TxHandle, UncommittedReads,
};
pub use keyspan_store::MemoryStore;
pub use keyspan_txn::applied::{AppliedRequests, InMemoryAppliedSet, SharedAppliedSet, StoreAppliedSet};
pub use keyspan_txn::record::{TxRecord, TxState};
pub use keyspan_txn::request::{ItemOp, ItemRequest, RequestAction, TxRequest};
