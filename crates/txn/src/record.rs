//! Transaction records
//!
//! One durable record per transaction, stored as a regular item in a
//! dedicated table. The record is the transaction's source of truth: its
//! state, its full request log, and a version counter that turns every
//! record write into a compare-and-set.
//!
//! ## Stored layout
//!
//! | attribute      | type | content                          |
//! |----------------|------|----------------------------------|
//! | `_id`          | Str  | transaction id                   |
//! | `_state`       | Str  | state name                       |
//! | `_version`     | Int  | bumped by one on every write     |
//! | `_requests`    | Str  | request log as JSON              |
//! | `_last_update` | Int  | unix microseconds of last write  |

use crate::request::{RequestAction, TxRequest};
use chrono::{DateTime, Utc};
use keyspan_core::{
    AttrMap, AttrValue, ItemKey, RequestId, TxError, TxId, TxResult, TxVersion,
};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Attribute holding the transaction id.
pub const ATTR_TX_ID: &str = "_id";
/// Attribute holding the state name.
pub const ATTR_TX_STATE: &str = "_state";
/// Attribute holding the compare-and-set version.
pub const ATTR_TX_VERSION: &str = "_version";
/// Attribute holding the JSON-encoded request log.
pub const ATTR_TX_REQUESTS: &str = "_requests";
/// Attribute holding the last-update time in unix microseconds.
pub const ATTR_TX_LAST_UPDATE: &str = "_last_update";

/// Lifecycle state of a transaction.
///
/// ```text
/// Active -> Committing  -> Committed
///       \-> RollingBack -> RolledBack
/// ```
///
/// Committed and RolledBack are terminal. No other transitions exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting requests
    Active,
    /// Commit decided, completion in progress
    Committing,
    /// Commit finished. Terminal.
    Committed,
    /// Rollback decided, completion in progress
    RollingBack,
    /// Rollback finished. Terminal.
    RolledBack,
}

impl TxState {
    /// Stored name of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::RollingBack => "rolling_back",
            TxState::RolledBack => "rolled_back",
        }
    }

    /// Parse a stored state name.
    pub fn parse(s: &str) -> Option<TxState> {
        match s {
            "active" => Some(TxState::Active),
            "committing" => Some(TxState::Committing),
            "committed" => Some(TxState::Committed),
            "rolling_back" => Some(TxState::RollingBack),
            "rolled_back" => Some(TxState::RolledBack),
            _ => None,
        }
    }

    /// Whether this state never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: TxState) -> bool {
        matches!(
            (self, next),
            (TxState::Active, TxState::Committing)
                | (TxState::Active, TxState::RollingBack)
                | (TxState::Committing, TxState::Committed)
                | (TxState::RollingBack, TxState::RolledBack)
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The durable record of one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    /// Transaction id
    pub id: TxId,
    /// Current lifecycle state
    pub state: TxState,
    /// Compare-and-set version, starting at 1
    pub version: u64,
    /// Every request accepted so far, in order
    pub requests: Vec<TxRequest>,
    /// When the record was last written
    pub last_update: DateTime<Utc>,
}

impl TxRecord {
    /// Fresh Active record.
    pub fn new(id: TxId) -> Self {
        TxRecord {
            id,
            state: TxState::Active,
            version: 1,
            requests: Vec::new(),
            last_update: Utc::now(),
        }
    }

    /// Id the next appended request will get.
    pub fn next_request_id(&self) -> RequestId {
        self.requests.last().map(|r| r.id + 1).unwrap_or(1)
    }

    /// Look up a request by id.
    pub fn request(&self, id: RequestId) -> Option<&TxRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    /// Every (transaction, request) version this record covers.
    pub fn versions(&self) -> Vec<TxVersion> {
        self.requests
            .iter()
            .map(|r| TxVersion::new(self.id.clone(), r.id))
            .collect()
    }

    /// Every touched item with the single action that decides its fate at
    /// release: the write action if one exists, otherwise Get.
    ///
    /// At most one request may write a given item, so the write action is
    /// unambiguous.
    pub fn key_actions(&self) -> BTreeMap<ItemKey, RequestAction> {
        let mut out: BTreeMap<ItemKey, RequestAction> = BTreeMap::new();
        for request in &self.requests {
            for op in &request.ops {
                let action = op.action();
                let entry = out.entry(op.key().clone()).or_insert(action);
                if action.is_write() {
                    *entry = action;
                }
            }
        }
        out
    }

    /// The request that wrote an item, if any. Its before-image is the
    /// item's pre-transaction value.
    pub fn writing_request(&self, key: &ItemKey) -> Option<RequestId> {
        self.requests.iter().find_map(|request| {
            request
                .ops
                .iter()
                .any(|op| op.action().is_write() && op.key() == key)
                .then_some(request.id)
        })
    }

    /// Every (version, item) pair a before-image could exist under.
    /// Used to enumerate images for deletion; deleting a never-written
    /// image is harmless.
    pub fn image_plan(&self) -> Vec<(TxVersion, ItemKey)> {
        let mut out = Vec::new();
        for request in &self.requests {
            for op in &request.ops {
                if op.action().is_write() {
                    out.push((
                        TxVersion::new(self.id.clone(), request.id),
                        op.key().clone(),
                    ));
                }
            }
        }
        out
    }

    /// Whether the record has gone `window` without an update.
    pub fn is_stale(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_update);
        idle.num_microseconds()
            .map_or(true, |us| us >= window.as_micros() as i64)
    }

    /// Encode into the stored item layout.
    pub fn encode(&self) -> TxResult<AttrMap> {
        let requests = serde_json::to_string(&self.requests)
            .map_err(|e| TxError::Assertion(format!("encoding request log: {}", e)))?;
        let mut item = AttrMap::new();
        item.insert(ATTR_TX_ID.into(), AttrValue::Str(self.id.as_str().into()));
        item.insert(
            ATTR_TX_STATE.into(),
            AttrValue::Str(self.state.as_str().into()),
        );
        item.insert(ATTR_TX_VERSION.into(), AttrValue::Int(self.version as i64));
        item.insert(ATTR_TX_REQUESTS.into(), AttrValue::Str(requests));
        item.insert(
            ATTR_TX_LAST_UPDATE.into(),
            AttrValue::Int(self.last_update.timestamp_micros()),
        );
        Ok(item)
    }

    /// Decode from the stored item layout. Any shape violation is an
    /// assertion error: records are only ever written by this module.
    pub fn decode(item: &AttrMap) -> TxResult<TxRecord> {
        let id = item
            .get(ATTR_TX_ID)
            .and_then(AttrValue::as_str)
            .ok_or_else(|| malformed(ATTR_TX_ID))?;
        let state = item
            .get(ATTR_TX_STATE)
            .and_then(AttrValue::as_str)
            .and_then(TxState::parse)
            .ok_or_else(|| malformed(ATTR_TX_STATE))?;
        let version = item
            .get(ATTR_TX_VERSION)
            .and_then(AttrValue::as_int)
            .filter(|v| *v >= 1)
            .ok_or_else(|| malformed(ATTR_TX_VERSION))?;
        let requests: Vec<TxRequest> = item
            .get(ATTR_TX_REQUESTS)
            .and_then(AttrValue::as_str)
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| TxError::Assertion(format!("decoding request log: {}", e)))?
            .ok_or_else(|| malformed(ATTR_TX_REQUESTS))?;
        let last_update = item
            .get(ATTR_TX_LAST_UPDATE)
            .and_then(AttrValue::as_int)
            .and_then(DateTime::from_timestamp_micros)
            .ok_or_else(|| malformed(ATTR_TX_LAST_UPDATE))?;
        Ok(TxRecord {
            id: TxId::new(id),
            state,
            version: version as u64,
            requests,
            last_update,
        })
    }
}

fn malformed(attr: &str) -> TxError {
    TxError::Assertion(format!("transaction record missing or malformed {}", attr))
}
