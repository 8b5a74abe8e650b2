//! Transaction protocol building blocks
//!
//! Everything between the raw store and the coordinator: durable
//! transaction records with compare-and-set writes, per-item locks,
//! before-images, applied-request tracking and the healing decision for
//! contested locks.
//!
//! Nothing here drives a transaction end to end. The pieces are exposed
//! separately so the coordinator crate can sequence them, and so tests
//! can exercise each protocol step in isolation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applied;
pub mod healing;
pub mod images;
pub mod lock;
pub mod record;
pub mod record_store;
pub mod request;

pub use applied::{
    AppliedRequests, InMemoryAppliedSet, SharedAppliedSet, StoreAppliedSet, ATTR_MARKER,
};
pub use healing::{decide, HealAction};
pub use images::{
    ItemImageStore, ATTR_IMAGE_ID, ATTR_IMAGE_PAYLOAD, ATTR_IMAGE_REQUEST, ATTR_IMAGE_TX,
};
pub use lock::{
    items_to_backup, release_disposition, Disposition, LockedItem, LockedItemStore, LockedItems,
};
pub use record::{
    TxRecord, TxState, ATTR_TX_ID, ATTR_TX_LAST_UPDATE, ATTR_TX_REQUESTS, ATTR_TX_STATE,
    ATTR_TX_VERSION,
};
pub use record_store::TxRecordStore;
pub use request::{
    ensure_no_write_overlap, put_key, validate_ops, ItemOp, ItemRequest, RequestAction, TxRequest,
};
