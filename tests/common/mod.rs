//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Notify;

pub use keyspan::{
    lock_state, visible_record, AttrMap, AttrValue, Condition, EngineConfig, IsolationLevel,
    ItemKey, ItemRecord, ItemRequest, KeyValueStore, MemoryStore, RetryConfig, StoreError,
    StoreLimits, StoreResult, SweepAction, Sweeper, TxCoordinator, TxError, TxId, TxState,
    UpdateOp, WriteOp, ATTR_APPLIED, ATTR_LOCK_OWNER,
};

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a tracing subscriber once per test binary.
///
/// Silent by default; turn on with e.g.
/// `RUST_LOG=keyspan::txn=debug cargo test --test transactions`.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}

// ============================================================================
// TestBed - provisioned store plus coordinator
// ============================================================================

/// A [`MemoryStore`] with the system tables and one data table `items`
/// (keyed by `id`) created, and a coordinator over it.
pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub txns: Arc<TxCoordinator>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Defaults except a staleness window long enough that no test actor
    /// ever looks stale by accident.
    pub fn patient() -> Self {
        Self::with_config(EngineConfig::default().with_staleness(Duration::from_secs(3600)))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_store(MemoryStore::new(), config)
    }

    /// Shrunken write ceiling, to force chunking without hundred-item
    /// fixtures.
    pub fn with_write_limit(limit: usize, config: EngineConfig) -> Self {
        let limits = StoreLimits {
            transact_write_items: limit,
            ..StoreLimits::default()
        };
        Self::with_store(MemoryStore::with_limits(limits), config)
    }

    fn with_store(store: MemoryStore, config: EngineConfig) -> Self {
        init_tracing();
        let store = Arc::new(store);
        provision(store.as_ref(), &config);
        let txns = Arc::new(TxCoordinator::with_config(store.clone(), config));
        TestBed { store, txns }
    }

    /// Write an item directly, bypassing the engine.
    pub async fn seed(&self, id: &str, n: i64) {
        self.store
            .put_item("items", item(id, n), Condition::none())
            .await
            .unwrap();
    }

    /// The raw stored row, lock attributes included.
    pub async fn raw(&self, id: &str) -> Option<AttrMap> {
        self.store.get_item(&key(id), true).await.unwrap()
    }

    /// The caller-visible `n` of an item, if the item exists.
    pub async fn n_of(&self, id: &str) -> Option<i64> {
        self.raw(id)
            .await
            .and_then(|raw| raw.get("n").and_then(AttrValue::as_int))
    }

    pub async fn assert_unlocked(&self, id: &str) {
        if let Some(raw) = self.raw(id).await {
            assert!(
                !lock_state(&raw).is_locked(),
                "item {} still carries lock attributes: {:?}",
                id,
                raw
            );
        }
    }

    pub fn tx_records(&self) -> usize {
        self.store.row_count(&self.txns.config().tx_table).unwrap()
    }

    pub fn images(&self) -> usize {
        self.store.row_count(&self.txns.config().image_table).unwrap()
    }
}

/// Create the record, image and `items` tables on a fresh store.
pub fn provision(store: &MemoryStore, config: &EngineConfig) {
    store
        .create_table(&config.tx_table, &[keyspan_txn::record::ATTR_TX_ID])
        .unwrap();
    store
        .create_table(&config.image_table, &[keyspan_txn::images::ATTR_IMAGE_ID])
        .unwrap();
    store.create_table("items", &["id"]).unwrap();
}

// ============================================================================
// Items
// ============================================================================

/// Key of an `items` row.
pub fn key(id: &str) -> ItemKey {
    ItemKey::single("items", "id", id)
}

/// An `items` row `{ id, n }`.
pub fn item(id: &str, n: i64) -> AttrMap {
    let mut map = AttrMap::new();
    map.insert("id".into(), AttrValue::Str(id.into()));
    map.insert("n".into(), AttrValue::Int(n));
    map
}

/// Update steps setting `n`.
pub fn set_n(n: i64) -> Vec<UpdateOp> {
    vec![UpdateOp::Set("n".into(), AttrValue::Int(n))]
}

// ============================================================================
// CountingStore - native-call accounting
// ============================================================================

/// Store wrapper that counts native write calls, for asserting how many
/// round trips a code path costs.
pub struct CountingStore {
    inner: MemoryStore,
    atomic_writes: AtomicU64,
    single_writes: AtomicU64,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        CountingStore {
            inner,
            atomic_writes: AtomicU64::new(0),
            single_writes: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Calls to `transact_write` so far.
    pub fn atomic_writes(&self) -> u64 {
        self.atomic_writes.load(Ordering::SeqCst)
    }

    /// Calls to `put_item`, `update_item` and `delete_item` so far.
    pub fn single_writes(&self) -> u64 {
        self.single_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for CountingStore {
    async fn get_item(&self, key: &ItemKey, consistent: bool) -> StoreResult<Option<AttrMap>> {
        self.inner.get_item(key, consistent).await
    }

    async fn put_item(&self, table: &str, item: AttrMap, condition: Condition) -> StoreResult<()> {
        self.single_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_item(table, item, condition).await
    }

    async fn update_item(
        &self,
        key: &ItemKey,
        ops: Vec<UpdateOp>,
        condition: Condition,
    ) -> StoreResult<AttrMap> {
        self.single_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_item(key, ops, condition).await
    }

    async fn delete_item(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> StoreResult<Option<AttrMap>> {
        self.single_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_item(key, condition).await
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.atomic_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.transact_write(ops).await
    }

    async fn transact_get(&self, keys: &[ItemKey]) -> StoreResult<Vec<Option<AttrMap>>> {
        self.inner.transact_get(keys).await
    }

    async fn batch_get(
        &self,
        keys: &[ItemKey],
        consistent: bool,
    ) -> StoreResult<Vec<Option<AttrMap>>> {
        self.inner.batch_get(keys, consistent).await
    }

    async fn scan_table(&self, table: &str, limit: Option<usize>) -> StoreResult<Vec<AttrMap>> {
        self.inner.scan_table(table, limit).await
    }

    async fn key_schema(&self, table: &str) -> StoreResult<Vec<String>> {
        self.inner.key_schema(table).await
    }

    fn limits(&self) -> StoreLimits {
        self.inner.limits()
    }
}

// ============================================================================
// GateStore - holds one lock-release write open
// ============================================================================

/// Store wrapper that parks the first lock-stripping `update_item` it
/// sees and only lets it through once the test says so. While the write
/// is parked the test can land other writes through the inner store,
/// which is how release-time races are staged deterministically.
pub struct GateStore {
    inner: MemoryStore,
    armed: AtomicBool,
    parked: Notify,
    resume: Notify,
}

impl GateStore {
    pub fn new(inner: MemoryStore) -> Self {
        GateStore {
            inner,
            armed: AtomicBool::new(true),
            parked: Notify::new(),
            resume: Notify::new(),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Resolves once a write has hit the gate and is waiting.
    pub async fn parked(&self) {
        self.parked.notified().await;
    }

    /// Let the parked write continue.
    pub fn release(&self) {
        self.resume.notify_one();
    }

    fn strips_lock(ops: &[UpdateOp]) -> bool {
        ops.iter()
            .any(|op| matches!(op, UpdateOp::Remove(name) if name == ATTR_LOCK_OWNER))
    }
}

#[async_trait]
impl KeyValueStore for GateStore {
    async fn get_item(&self, key: &ItemKey, consistent: bool) -> StoreResult<Option<AttrMap>> {
        self.inner.get_item(key, consistent).await
    }

    async fn put_item(&self, table: &str, item: AttrMap, condition: Condition) -> StoreResult<()> {
        self.inner.put_item(table, item, condition).await
    }

    async fn update_item(
        &self,
        key: &ItemKey,
        ops: Vec<UpdateOp>,
        condition: Condition,
    ) -> StoreResult<AttrMap> {
        if Self::strips_lock(&ops) && self.armed.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.resume.notified().await;
        }
        self.inner.update_item(key, ops, condition).await
    }

    async fn delete_item(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> StoreResult<Option<AttrMap>> {
        self.inner.delete_item(key, condition).await
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.inner.transact_write(ops).await
    }

    async fn transact_get(&self, keys: &[ItemKey]) -> StoreResult<Vec<Option<AttrMap>>> {
        self.inner.transact_get(keys).await
    }

    async fn batch_get(
        &self,
        keys: &[ItemKey],
        consistent: bool,
    ) -> StoreResult<Vec<Option<AttrMap>>> {
        self.inner.batch_get(keys, consistent).await
    }

    async fn scan_table(&self, table: &str, limit: Option<usize>) -> StoreResult<Vec<AttrMap>> {
        self.inner.scan_table(table, limit).await
    }

    async fn key_schema(&self, table: &str) -> StoreResult<Vec<String>> {
        self.inner.key_schema(table).await
    }

    fn limits(&self) -> StoreLimits {
        self.inner.limits()
    }
}
