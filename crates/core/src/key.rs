//! Item keys
//!
//! This module defines:
//! - KeyAttr: Scalar attribute types allowed in a primary key
//! - ItemKey: Fully-qualified item address (table + primary key attributes)
//!
//! Primary keys are restricted to scalar types (Str, Int, Bytes) so that
//! `ItemKey` can be ordered and hashed. Float never appears in a key: its
//! IEEE-754 equality (`NaN != NaN`) cannot satisfy `Eq`.

use crate::value::AttrValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar attribute value usable inside a primary key.
///
/// This is the subset of [`AttrValue`] with total ordering and stable
/// hashing. Conversion from a full `AttrValue` fails for the non-scalar
/// variants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyAttr {
    /// UTF-8 string key component
    Str(String),
    /// 64-bit signed integer key component
    Int(i64),
    /// Raw bytes key component
    Bytes(Vec<u8>),
}

impl KeyAttr {
    /// Convert a general attribute value into a key attribute.
    ///
    /// Returns `None` for Null, Bool, Float, List and Map.
    pub fn from_value(value: &AttrValue) -> Option<KeyAttr> {
        match value {
            AttrValue::Str(s) => Some(KeyAttr::Str(s.clone())),
            AttrValue::Int(i) => Some(KeyAttr::Int(*i)),
            AttrValue::Bytes(b) => Some(KeyAttr::Bytes(b.clone())),
            _ => None,
        }
    }

    /// Widen back into a general attribute value.
    pub fn to_value(&self) -> AttrValue {
        match self {
            KeyAttr::Str(s) => AttrValue::Str(s.clone()),
            KeyAttr::Int(i) => AttrValue::Int(*i),
            KeyAttr::Bytes(b) => AttrValue::Bytes(b.clone()),
        }
    }
}

impl fmt::Display for KeyAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAttr::Str(s) => write!(f, "{}", s),
            KeyAttr::Int(i) => write!(f, "{}", i),
            KeyAttr::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for KeyAttr {
    fn from(s: &str) -> Self {
        KeyAttr::Str(s.to_string())
    }
}

impl From<String> for KeyAttr {
    fn from(s: String) -> Self {
        KeyAttr::Str(s)
    }
}

impl From<i64> for KeyAttr {
    fn from(i: i64) -> Self {
        KeyAttr::Int(i)
    }
}

/// Fully-qualified address of one item: the table it lives in plus its
/// primary-key attributes.
///
/// Keys order by table name first, then by primary-key attributes, so
/// sorted key collections group by table. Equal keys always address the
/// same stored item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Table holding the item
    pub table: String,
    /// Primary-key attribute names and values, in attribute-name order
    pub pk: BTreeMap<String, KeyAttr>,
}

impl ItemKey {
    /// Create a key from a table name and primary-key attributes.
    pub fn new(table: impl Into<String>, pk: BTreeMap<String, KeyAttr>) -> Self {
        ItemKey {
            table: table.into(),
            pk,
        }
    }

    /// Create a key with a single primary-key attribute.
    pub fn single(
        table: impl Into<String>,
        attr: impl Into<String>,
        value: impl Into<KeyAttr>,
    ) -> Self {
        let mut pk = BTreeMap::new();
        pk.insert(attr.into(), value.into());
        ItemKey {
            table: table.into(),
            pk,
        }
    }

    /// Primary-key attributes widened to general values, for merging into
    /// an item map.
    pub fn pk_values(&self) -> impl Iterator<Item = (String, AttrValue)> + '_ {
        self.pk.iter().map(|(name, attr)| (name.clone(), attr.to_value()))
    }

    /// Collision-free text digest of this key.
    ///
    /// Used to build single-attribute identifiers for rows that reference
    /// an item, such as before-image records. String and byte components
    /// are hex-encoded so no input can forge the separators.
    pub fn digest(&self) -> String {
        let mut out = hex_of(self.table.as_bytes());
        for (name, attr) in &self.pk {
            out.push(':');
            out.push_str(&hex_of(name.as_bytes()));
            out.push('=');
            match attr {
                KeyAttr::Str(s) => {
                    out.push('s');
                    out.push_str(&hex_of(s.as_bytes()));
                }
                KeyAttr::Int(i) => {
                    out.push('n');
                    out.push_str(&i.to_string());
                }
                KeyAttr::Bytes(b) => {
                    out.push('b');
                    out.push_str(&hex_of(b));
                }
            }
        }
        out
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.table)?;
        let mut first = true;
        for (name, attr) in &self.pk {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, attr)?;
            first = false;
        }
        write!(f, "}}")
    }
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
