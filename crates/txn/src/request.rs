//! The unit of work inside a transaction
//!
//! A request is an ordered list of item operations submitted together.
//! Two forms exist:
//! - [`ItemRequest`]: what callers hand in. A put carries the raw item
//!   and its table; the key is not spelled out.
//! - [`ItemOp`]: the resolved, logged form. Every op addresses an
//!   explicit [`ItemKey`], so replay and release paths never need the
//!   table schema again.

use keyspan_core::{
    is_reserved_attr, AttrCheck, AttrMap, Condition, ItemKey, KeyAttr, RequestId, TxError,
    TxResult, UpdateOp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a request does to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestAction {
    /// Read the item under a lock
    Get,
    /// Replace the whole item
    Put,
    /// Edit attributes in place
    Update,
    /// Delete the item at commit
    Delete,
    /// Assert a condition without writing
    ConditionCheck,
}

impl RequestAction {
    /// Whether this action mutates the item.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            RequestAction::Put | RequestAction::Update | RequestAction::Delete
        )
    }
}

/// Caller-facing form of one item operation.
#[derive(Debug, Clone)]
pub enum ItemRequest {
    /// Read one item under this transaction's lock.
    Get {
        /// Item to read
        key: ItemKey,
    },
    /// Replace (or create) a whole item.
    Put {
        /// Table to write into
        table: String,
        /// Full item, primary-key attributes included
        item: AttrMap,
    },
    /// Edit attributes of one item.
    Update {
        /// Item to edit
        key: ItemKey,
        /// Steps applied in order
        ops: Vec<UpdateOp>,
    },
    /// Delete one item at commit.
    Delete {
        /// Item to delete
        key: ItemKey,
    },
    /// Assert a condition against one item.
    ConditionCheck {
        /// Item to check
        key: ItemKey,
        /// Condition that must hold at apply time
        condition: Condition,
    },
}

/// Resolved, logged form of one item operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemOp {
    /// Read one item under the transaction's lock.
    Get {
        /// Item to read
        key: ItemKey,
    },
    /// Replace (or create) a whole item.
    Put {
        /// Item address, derived from the table schema at submission
        key: ItemKey,
        /// Full item as the caller supplied it
        item: AttrMap,
    },
    /// Edit attributes of one item.
    Update {
        /// Item to edit
        key: ItemKey,
        /// Steps applied in order
        ops: Vec<UpdateOp>,
    },
    /// Delete one item at commit.
    Delete {
        /// Item to delete
        key: ItemKey,
    },
    /// Assert a condition against one item.
    ConditionCheck {
        /// Item to check
        key: ItemKey,
        /// Condition that must hold at apply time
        condition: Condition,
    },
}

impl ItemOp {
    /// The item this op addresses.
    pub fn key(&self) -> &ItemKey {
        match self {
            ItemOp::Get { key } => key,
            ItemOp::Put { key, .. } => key,
            ItemOp::Update { key, .. } => key,
            ItemOp::Delete { key } => key,
            ItemOp::ConditionCheck { key, .. } => key,
        }
    }

    /// This op's action kind.
    pub fn action(&self) -> RequestAction {
        match self {
            ItemOp::Get { .. } => RequestAction::Get,
            ItemOp::Put { .. } => RequestAction::Put,
            ItemOp::Update { .. } => RequestAction::Update,
            ItemOp::Delete { .. } => RequestAction::Delete,
            ItemOp::ConditionCheck { .. } => RequestAction::ConditionCheck,
        }
    }
}

/// One logged request: its position in the transaction and its ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRequest {
    /// Position within the transaction, starting at 1
    pub id: RequestId,
    /// Item operations, in submission order
    pub ops: Vec<ItemOp>,
}

impl TxRequest {
    /// Every key this request touches, in op order.
    pub fn keys(&self) -> Vec<ItemKey> {
        self.ops.iter().map(|op| op.key().clone()).collect()
    }
}

/// Derive a put's item key from the table's key schema.
pub fn put_key(table: &str, schema: &[String], item: &AttrMap) -> TxResult<ItemKey> {
    let mut pk = std::collections::BTreeMap::new();
    for attr in schema {
        let value = item.get(attr).ok_or_else(|| {
            TxError::Validation(format!(
                "put into table {} is missing key attribute {}",
                table, attr
            ))
        })?;
        let scalar = KeyAttr::from_value(value).ok_or_else(|| {
            TxError::Validation(format!(
                "key attribute {} of table {} must be Str, Int or Bytes, got {}",
                attr,
                table,
                value.type_name()
            ))
        })?;
        pk.insert(attr.clone(), scalar);
    }
    Ok(ItemKey::new(table, pk))
}

/// Validate a resolved request before it is logged.
///
/// Rejects empty requests, reserved attribute names anywhere in caller
/// input, and two ops addressing the same item.
pub fn validate_ops(ops: &[ItemOp]) -> TxResult<()> {
    if ops.is_empty() {
        return Err(TxError::Validation("request has no operations".into()));
    }
    let mut seen = HashSet::new();
    for op in ops {
        let key = op.key();
        for name in key.pk.keys() {
            check_attr_name(name)?;
        }
        match op {
            ItemOp::Put { item, .. } => {
                for name in item.keys() {
                    check_attr_name(name)?;
                }
            }
            ItemOp::Update { ops, .. } => {
                for update in ops {
                    check_attr_name(update.attr_name())?;
                }
            }
            ItemOp::ConditionCheck { condition, .. } => {
                for check in condition.checks() {
                    match check {
                        AttrCheck::Absent(name)
                        | AttrCheck::Present(name)
                        | AttrCheck::Equals(name, _) => check_attr_name(name)?,
                        AttrCheck::ItemExists | AttrCheck::ItemNotExists => {}
                    }
                }
            }
            ItemOp::Get { .. } | ItemOp::Delete { .. } => {}
        }
        if !seen.insert(key.clone()) {
            return Err(TxError::Validation(format!(
                "request addresses {} more than once",
                key
            )));
        }
    }
    Ok(())
}

/// A new request may not write an item an earlier request of the same
/// transaction already wrote. Reads of such items are fine: they see the
/// applied value.
pub fn ensure_no_write_overlap(log: &[TxRequest], ops: &[ItemOp]) -> TxResult<()> {
    for op in ops {
        if !op.action().is_write() {
            continue;
        }
        for earlier in log {
            if earlier
                .ops
                .iter()
                .any(|e| e.action().is_write() && e.key() == op.key())
            {
                return Err(TxError::DuplicateRequest {
                    key: op.key().clone(),
                    request_id: earlier.id,
                });
            }
        }
    }
    Ok(())
}

fn check_attr_name(name: &str) -> TxResult<()> {
    if is_reserved_attr(name) {
        return Err(TxError::Validation(format!(
            "attribute name {} is reserved",
            name
        )));
    }
    Ok(())
}
