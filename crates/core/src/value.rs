//! Attribute values for Keyspan items
//!
//! This module defines:
//! - AttrValue: Unified enum for all attribute types an item can hold
//! - AttrMap: An item as stored, attribute name to value
//! - ItemRecord: An item as seen by callers, with lock bookkeeping removed
//!
//! ## Value Model (Frozen)
//!
//! The AttrValue enum has exactly 8 variants:
//! - Null, Bool, Int, Float, Str, Bytes, List, Map
//!
//! ### Type Rules
//!
//! - Eight types only, no implicit coercions
//! - `Int(1) != Float(1.0)` - different types are NEVER equal
//! - `Bytes` are not `Str`
//! - Float uses IEEE-754 equality: `NaN != NaN`, `-0.0 == 0.0`
//!
//! Float equality matters here because conditional writes compare stored
//! attributes against expected values. A store that treated `NaN == NaN`
//! would let a conditional write succeed against a value the caller can
//! never reproduce.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An item as stored: attribute name to value.
///
/// `BTreeMap` keeps attribute iteration deterministic, which the engine
/// relies on when encoding records and digesting primary keys.
pub type AttrMap = BTreeMap<String, AttrValue>;

/// An item as returned to callers: the same shape as [`AttrMap`], but with
/// the reserved lock-bookkeeping attributes stripped out.
pub type ItemRecord = AttrMap;

/// Canonical attribute value type for all item data
///
/// ## Type Equality
///
/// Different types are NEVER equal, even if they contain the same "value":
/// - `Int(1) != Float(1.0)`
/// - `Bytes(b"hello") != Str("hello")`
///
/// Float equality follows IEEE-754 semantics:
/// - `NaN != NaN`
/// - `-0.0 == 0.0`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttrValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<AttrValue>),
    /// Nested map with string keys
    Map(BTreeMap<String, AttrValue>),
}

// Custom PartialEq implementation for IEEE-754 float semantics
impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttrValue::Null, AttrValue::Null) => true,
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a == b,
            (AttrValue::Int(a), AttrValue::Int(b)) => a == b,
            // IEEE-754: NaN != NaN, -0.0 == 0.0
            (AttrValue::Float(a), AttrValue::Float(b)) => a == b,
            (AttrValue::Str(a), AttrValue::Str(b)) => a == b,
            (AttrValue::Bytes(a), AttrValue::Bytes(b)) => a == b,
            (AttrValue::List(a), AttrValue::List(b)) => a == b,
            (AttrValue::Map(a), AttrValue::Map(b)) => a == b,
            // Different types are NEVER equal
            _ => false,
        }
    }
}

impl AttrValue {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Null => "Null",
            AttrValue::Bool(_) => "Bool",
            AttrValue::Int(_) => "Int",
            AttrValue::Float(_) => "Float",
            AttrValue::Str(_) => "Str",
            AttrValue::Bytes(_) => "Bytes",
            AttrValue::List(_) => "List",
            AttrValue::Map(_) => "Map",
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if this is a Float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as &str if this is a Str value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as &[u8] if this is a Bytes value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as &[AttrValue] if this is a List value
    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as &BTreeMap if this is a Map value
    pub fn as_map(&self) -> Option<&BTreeMap<String, AttrValue>> {
        match self {
            AttrValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

// ============================================================================
// From implementations for ergonomic API usage
// ============================================================================

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(f: f64) -> Self {
        AttrValue::Float(f)
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(b: Vec<u8>) -> Self {
        AttrValue::Bytes(b)
    }
}

impl From<Vec<AttrValue>> for AttrValue {
    fn from(l: Vec<AttrValue>) -> Self {
        AttrValue::List(l)
    }
}
