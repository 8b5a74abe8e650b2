//! Identifier types
//!
//! This module defines:
//! - TxId: Unique identifier for a transaction
//! - RequestId: Position of a request within one transaction
//! - TxVersion: A (transaction, request) pair naming one applied mutation

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix marking synthetic ids minted for single-shot atomic writes that
/// bypass the transaction record.
const QUICK_PREFIX: &str = "q#";

/// Unique identifier for a transaction.
///
/// Backed by a string rather than a raw UUID: ids written into item lock
/// attributes must survive round-trips through the store as plain strings,
/// and synthetic ids (see [`TxId::quick`]) are not UUIDs at all.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(String);

impl TxId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        TxId(Uuid::new_v4().simple().to_string())
    }

    /// Generate a fresh synthetic id for a single-shot atomic write.
    ///
    /// Quick ids never correspond to a stored transaction record, so a
    /// lock bearing one is always an orphan.
    pub fn quick() -> Self {
        TxId(format!("{}{}", QUICK_PREFIX, Uuid::new_v4().simple()))
    }

    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        TxId(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted by [`TxId::quick`].
    pub fn is_quick(&self) -> bool {
        self.0.starts_with(QUICK_PREFIX)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TxId {
    fn from(s: &str) -> Self {
        TxId(s.to_string())
    }
}

impl From<String> for TxId {
    fn from(s: String) -> Self {
        TxId(s)
    }
}

/// Position of a request within its transaction, starting at 1.
pub type RequestId = u32;

/// A (transaction, request) pair.
///
/// Names exactly one mutation attempt: before-images and fully-applied
/// markers are both keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxVersion {
    /// Owning transaction
    pub tx_id: TxId,
    /// Request within that transaction
    pub request_id: RequestId,
}

impl TxVersion {
    /// Create a version from its parts.
    pub fn new(tx_id: TxId, request_id: RequestId) -> Self {
        TxVersion { tx_id, request_id }
    }
}

impl fmt::Display for TxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_id, self.request_id)
    }
}
