//! Core types and traits for Keyspan
//!
//! This crate defines the foundational types used throughout the system:
//! - AttrValue / AttrMap / ItemRecord: the item data model
//! - KeyAttr / ItemKey: item addressing
//! - TxId / RequestId / TxVersion: transaction identifiers
//! - ItemTxState and the reserved `_txn*` attributes: lock bookkeeping
//! - Condition / UpdateOp / WriteOp: the conditional-write model
//! - StoreError / TxError: the error hierarchy
//! - KeyValueStore: the store contract the engine runs against

#![warn(missing_docs)]
#![warn(clippy::all)]

// Module declarations
pub mod error;
pub mod item_state;
pub mod key;
pub mod ops;
pub mod traits;
pub mod types;
pub mod value;

// Re-export commonly used types and traits
pub use error::{
    ConditionFailure, LockConflict, StoreError, StoreResult, TxError, TxResult,
};
pub use item_state::{
    is_reserved_attr, lock_state, split_item, strip_lock_attrs, visible_record, ItemTxState,
    ATTR_APPLIED, ATTR_LOCK_OWNER, ATTR_TRANSIENT, RESERVED_PREFIX,
};
pub use key::{ItemKey, KeyAttr};
pub use ops::{apply_updates, AttrCheck, Condition, UpdateOp, WriteOp};
pub use traits::{KeyValueStore, SharedStore, StoreLimits};
pub use types::{RequestId, TxId, TxVersion};
pub use value::{AttrMap, AttrValue, ItemRecord};
