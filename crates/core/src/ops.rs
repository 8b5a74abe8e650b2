//! Write operations and conditions
//!
//! The store contract is conditional-write shaped: every mutation carries a
//! [`Condition`] evaluated against the item's current state, and the write
//! happens only if the condition holds. The engine builds its locking
//! protocol out of nothing but these conditions.
//!
//! Condition evaluation is a pure function ([`Condition::eval`]) so store
//! implementations and engine-side checks share one set of semantics.

use crate::key::ItemKey;
use crate::value::{AttrMap, AttrValue};
use serde::{Deserialize, Serialize};

/// One check inside a [`Condition`].
///
/// Checks evaluate against "the current item, or no item". Attribute checks
/// on a missing item behave like checks on an empty item: `Absent` holds,
/// `Present` and `Equals` do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrCheck {
    /// The item must exist.
    ItemExists,
    /// The item must not exist.
    ItemNotExists,
    /// The named attribute must be absent (or the item missing).
    Absent(String),
    /// The named attribute must be present.
    Present(String),
    /// The named attribute must equal the given value.
    Equals(String, AttrValue),
}

impl AttrCheck {
    fn eval(&self, item: Option<&AttrMap>) -> bool {
        match self {
            AttrCheck::ItemExists => item.is_some(),
            AttrCheck::ItemNotExists => item.is_none(),
            AttrCheck::Absent(name) => item.map_or(true, |m| !m.contains_key(name)),
            AttrCheck::Present(name) => item.map_or(false, |m| m.contains_key(name)),
            AttrCheck::Equals(name, expected) => {
                item.and_then(|m| m.get(name)).map_or(false, |v| v == expected)
            }
        }
    }
}

/// Conjunction of [`AttrCheck`]s guarding a write. An empty condition always
/// holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    checks: Vec<AttrCheck>,
}

impl Condition {
    /// The empty, always-true condition.
    pub fn none() -> Self {
        Condition::default()
    }

    /// Require the item to exist.
    pub fn item_exists() -> Self {
        Condition::none().and(AttrCheck::ItemExists)
    }

    /// Require the item not to exist.
    pub fn item_not_exists() -> Self {
        Condition::none().and(AttrCheck::ItemNotExists)
    }

    /// Require an attribute to be absent.
    pub fn attr_absent(name: impl Into<String>) -> Self {
        Condition::none().and(AttrCheck::Absent(name.into()))
    }

    /// Require an attribute to equal a value.
    pub fn attr_eq(name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Condition::none().and(AttrCheck::Equals(name.into(), value.into()))
    }

    /// Add one more check.
    pub fn and(mut self, check: AttrCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// Whether the condition has no checks.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// The individual checks, for validation.
    pub fn checks(&self) -> &[AttrCheck] {
        &self.checks
    }

    /// Evaluate against the current item (`None` = item does not exist).
    pub fn eval(&self, item: Option<&AttrMap>) -> bool {
        self.checks.iter().all(|c| c.eval(item))
    }
}

/// One step of an in-place item update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOp {
    /// Set an attribute to a value, adding it if absent.
    Set(String, AttrValue),
    /// Remove an attribute if present.
    Remove(String),
}

impl UpdateOp {
    /// The attribute this op touches.
    pub fn attr_name(&self) -> &str {
        match self {
            UpdateOp::Set(name, _) => name,
            UpdateOp::Remove(name) => name,
        }
    }
}

/// Apply update steps to an item map in order.
pub fn apply_updates(item: &mut AttrMap, ops: &[UpdateOp]) {
    for op in ops {
        match op {
            UpdateOp::Set(name, value) => {
                item.insert(name.clone(), value.clone());
            }
            UpdateOp::Remove(name) => {
                item.remove(name);
            }
        }
    }
}

/// One write inside an atomic multi-item call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Replace (or create) a whole item.
    Put {
        /// Table to write into
        table: String,
        /// Full item, primary-key attributes included
        item: AttrMap,
        /// Guard for the write
        condition: Condition,
    },
    /// Edit attributes of one item, creating it if absent.
    Update {
        /// Item to edit
        key: ItemKey,
        /// Steps applied in order
        ops: Vec<UpdateOp>,
        /// Guard for the write
        condition: Condition,
    },
    /// Delete one item.
    Delete {
        /// Item to delete
        key: ItemKey,
        /// Guard for the delete
        condition: Condition,
    },
    /// Assert a condition on an item without writing it.
    ConditionCheck {
        /// Item to check
        key: ItemKey,
        /// Condition that must hold
        condition: Condition,
    },
}

impl WriteOp {
    /// The condition guarding this op.
    pub fn condition(&self) -> &Condition {
        match self {
            WriteOp::Put { condition, .. } => condition,
            WriteOp::Update { condition, .. } => condition,
            WriteOp::Delete { condition, .. } => condition,
            WriteOp::ConditionCheck { condition, .. } => condition,
        }
    }
}
