//! Hidden lock attributes and their decoded form
//!
//! Lock state lives inside the item itself, in attributes reserved by the
//! engine. This module is the single decoder for those attributes: both
//! the read paths and the write paths go through [`split_item`] /
//! [`lock_state`], so the two sides can never disagree about what a raw
//! item means.

use crate::types::TxId;
use crate::value::{AttrMap, AttrValue, ItemRecord};

/// Attribute naming the transaction currently holding the item's lock.
pub const ATTR_LOCK_OWNER: &str = "_txn_id";
/// Attribute set once the owning request's mutation has been applied.
pub const ATTR_APPLIED: &str = "_txn_applied";
/// Attribute marking an item that exists only to hold a lock.
pub const ATTR_TRANSIENT: &str = "_txn_transient";

/// Prefix reserved for engine bookkeeping. Caller-supplied attribute names
/// must not start with it.
pub const RESERVED_PREFIX: &str = "_txn";

/// Whether an attribute name is reserved for engine bookkeeping.
pub fn is_reserved_attr(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Lock state decoded from one raw item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemTxState {
    /// Transaction holding the lock, if any
    pub owner: Option<TxId>,
    /// The owning request's mutation has been applied to this item
    pub applied: bool,
    /// The item did not exist before it was locked
    pub transient: bool,
}

impl ItemTxState {
    /// Whether any transaction holds the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// Whether the given transaction holds the lock.
    pub fn locked_by(&self, id: &TxId) -> bool {
        self.owner.as_ref() == Some(id)
    }
}

/// Decode the lock state of a raw item.
pub fn lock_state(raw: &AttrMap) -> ItemTxState {
    ItemTxState {
        owner: raw
            .get(ATTR_LOCK_OWNER)
            .and_then(AttrValue::as_str)
            .map(TxId::from),
        applied: flag(raw, ATTR_APPLIED),
        transient: flag(raw, ATTR_TRANSIENT),
    }
}

/// Split a raw item into its caller-visible record and its lock state.
pub fn split_item(raw: &AttrMap) -> (ItemRecord, ItemTxState) {
    (visible_record(raw), lock_state(raw))
}

/// The caller-visible record of a raw item: every attribute except the
/// reserved ones.
pub fn visible_record(raw: &AttrMap) -> ItemRecord {
    raw.iter()
        .filter(|(name, _)| !is_reserved_attr(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Remove the reserved attributes in place.
pub fn strip_lock_attrs(item: &mut AttrMap) {
    item.retain(|name, _| !is_reserved_attr(name));
}

fn flag(raw: &AttrMap, name: &str) -> bool {
    raw.get(name).and_then(AttrValue::as_bool).unwrap_or(false)
}
