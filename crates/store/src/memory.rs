//! In-memory store
//!
//! [`MemoryStore`] implements the full [`KeyValueStore`] contract against
//! process memory:
//! - DashMap table registry, one entry per created table
//! - Per-table `RwLock<BTreeMap>` row storage, items in primary-key order
//! - `transact_write` locks every touched table in name order, evaluates
//!   all conditions, then applies all writes or none
//!
//! Tables are created explicitly with a key schema. There is no implicit
//! table creation: writes into an unknown table fail with
//! [`StoreError::TableNotFound`], same as a real store would report a
//! missing resource.

use async_trait::async_trait;
use dashmap::DashMap;
use keyspan_core::{
    apply_updates, AttrMap, Condition, ConditionFailure, ItemKey, KeyAttr, KeyValueStore,
    StoreError, StoreLimits, StoreResult, UpdateOp, WriteOp,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Row key inside one table: primary-key attribute name to scalar value.
type PrimaryKey = BTreeMap<String, KeyAttr>;

/// One table: its key schema and its rows.
#[derive(Clone)]
struct Table {
    schema: Arc<Vec<String>>,
    rows: Arc<RwLock<BTreeMap<PrimaryKey, AttrMap>>>,
}

/// In-memory [`KeyValueStore`] with conditional writes and a bounded
/// atomic multi-item write.
pub struct MemoryStore {
    tables: DashMap<String, Table>,
    limits: StoreLimits,
}

impl MemoryStore {
    /// Create a store with the default batch ceilings.
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    /// Create a store with explicit batch ceilings. Tests shrink these to
    /// force batching without building hundred-item fixtures.
    pub fn with_limits(limits: StoreLimits) -> Self {
        MemoryStore {
            tables: DashMap::new(),
            limits,
        }
    }

    /// Create a table with the given primary-key attribute names.
    ///
    /// Creating the same table twice with the same schema is a no-op;
    /// a different schema is an error.
    pub fn create_table(&self, name: &str, key_attrs: &[&str]) -> StoreResult<()> {
        if key_attrs.is_empty() {
            return Err(StoreError::Malformed(format!(
                "table {} needs at least one key attribute",
                name
            )));
        }
        let schema: Vec<String> = key_attrs.iter().map(|s| s.to_string()).collect();
        if let Some(existing) = self.tables.get(name) {
            if *existing.schema == schema {
                return Ok(());
            }
            return Err(StoreError::Malformed(format!(
                "table {} already exists with a different key schema",
                name
            )));
        }
        debug!(target: "keyspan::store", table = name, ?schema, "create table");
        self.tables.insert(
            name.to_string(),
            Table {
                schema: Arc::new(schema),
                rows: Arc::new(RwLock::new(BTreeMap::new())),
            },
        );
        Ok(())
    }

    /// Number of rows currently in a table. Test helper.
    pub fn row_count(&self, name: &str) -> StoreResult<usize> {
        Ok(self.table(name)?.rows.read().len())
    }

    fn table(&self, name: &str) -> StoreResult<Table> {
        self.tables
            .get(name)
            .map(|t| t.clone())
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    /// Pull the primary key out of a full item per the table's schema.
    fn extract_pk(table: &str, schema: &[String], item: &AttrMap) -> StoreResult<PrimaryKey> {
        let mut pk = BTreeMap::new();
        for attr in schema {
            let value = item.get(attr).ok_or_else(|| {
                StoreError::Malformed(format!(
                    "item for table {} is missing key attribute {}",
                    table, attr
                ))
            })?;
            let scalar = KeyAttr::from_value(value).ok_or_else(|| {
                StoreError::Malformed(format!(
                    "key attribute {} of table {} must be Str, Int or Bytes, got {}",
                    attr,
                    table,
                    value.type_name()
                ))
            })?;
            pk.insert(attr.clone(), scalar);
        }
        Ok(pk)
    }

    /// A caller-supplied key must name exactly the schema's attributes.
    fn check_key(schema: &[String], key: &ItemKey) -> StoreResult<()> {
        if key.pk.len() == schema.len() && schema.iter().all(|a| key.pk.contains_key(a)) {
            return Ok(());
        }
        Err(StoreError::Malformed(format!(
            "key {} does not match schema {:?} of table {}",
            key, schema, key.table
        )))
    }

    /// Updates may not rewrite key attributes; the row would detach from
    /// its own address.
    fn check_update_ops(schema: &[String], key: &ItemKey, ops: &[UpdateOp]) -> StoreResult<()> {
        for op in ops {
            if schema.iter().any(|a| a == op.attr_name()) {
                return Err(StoreError::Malformed(format!(
                    "update on {} modifies key attribute {}",
                    key,
                    op.attr_name()
                )));
            }
        }
        Ok(())
    }

    /// Fresh item containing only the primary-key attributes.
    fn seed_item(key: &ItemKey) -> AttrMap {
        key.pk_values().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One op of an atomic write, resolved against the table registry.
struct PlannedOp {
    key: ItemKey,
    condition: Condition,
    kind: PlannedKind,
}

enum PlannedKind {
    Put(AttrMap),
    Update(Vec<UpdateOp>),
    Delete,
    Check,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, key: &ItemKey, _consistent: bool) -> StoreResult<Option<AttrMap>> {
        let table = self.table(&key.table)?;
        Self::check_key(&table.schema, key)?;
        let rows = table.rows.read();
        Ok(rows.get(&key.pk).cloned())
    }

    async fn put_item(&self, table: &str, item: AttrMap, condition: Condition) -> StoreResult<()> {
        let t = self.table(table)?;
        let pk = Self::extract_pk(table, &t.schema, &item)?;
        let mut rows = t.rows.write();
        let current = rows.get(&pk);
        if !condition.eval(current) {
            return Err(StoreError::ConditionFailed(ConditionFailure {
                key: ItemKey::new(table, pk),
                current: current.cloned(),
            }));
        }
        rows.insert(pk, item);
        Ok(())
    }

    async fn update_item(
        &self,
        key: &ItemKey,
        ops: Vec<UpdateOp>,
        condition: Condition,
    ) -> StoreResult<AttrMap> {
        let t = self.table(&key.table)?;
        Self::check_key(&t.schema, key)?;
        Self::check_update_ops(&t.schema, key, &ops)?;
        let mut rows = t.rows.write();
        let current = rows.get(&key.pk);
        if !condition.eval(current) {
            return Err(StoreError::ConditionFailed(ConditionFailure {
                key: key.clone(),
                current: current.cloned(),
            }));
        }
        // Upsert: editing a missing item creates it from its key.
        let mut item = current.cloned().unwrap_or_else(|| Self::seed_item(key));
        apply_updates(&mut item, &ops);
        rows.insert(key.pk.clone(), item.clone());
        Ok(item)
    }

    async fn delete_item(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> StoreResult<Option<AttrMap>> {
        let t = self.table(&key.table)?;
        Self::check_key(&t.schema, key)?;
        let mut rows = t.rows.write();
        let current = rows.get(&key.pk);
        if !condition.eval(current) {
            return Err(StoreError::ConditionFailed(ConditionFailure {
                key: key.clone(),
                current: current.cloned(),
            }));
        }
        Ok(rows.remove(&key.pk))
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        if ops.len() > self.limits.transact_write_items {
            return Err(StoreError::BatchTooLarge {
                count: ops.len(),
                limit: self.limits.transact_write_items,
            });
        }

        // Resolve tables and keys up front, before taking any lock.
        let mut planned = Vec::with_capacity(ops.len());
        let mut tables: BTreeMap<String, Table> = BTreeMap::new();
        for op in ops {
            let planned_op = match op {
                WriteOp::Put {
                    table,
                    item,
                    condition,
                } => {
                    let t = self.table(&table)?;
                    let pk = Self::extract_pk(&table, &t.schema, &item)?;
                    tables.insert(table.clone(), t);
                    PlannedOp {
                        key: ItemKey::new(table, pk),
                        condition,
                        kind: PlannedKind::Put(item),
                    }
                }
                WriteOp::Update {
                    key,
                    ops,
                    condition,
                } => {
                    let t = self.table(&key.table)?;
                    Self::check_key(&t.schema, &key)?;
                    Self::check_update_ops(&t.schema, &key, &ops)?;
                    tables.insert(key.table.clone(), t);
                    PlannedOp {
                        key,
                        condition,
                        kind: PlannedKind::Update(ops),
                    }
                }
                WriteOp::Delete { key, condition } => {
                    let t = self.table(&key.table)?;
                    Self::check_key(&t.schema, &key)?;
                    tables.insert(key.table.clone(), t);
                    PlannedOp {
                        key,
                        condition,
                        kind: PlannedKind::Delete,
                    }
                }
                WriteOp::ConditionCheck { key, condition } => {
                    let t = self.table(&key.table)?;
                    Self::check_key(&t.schema, &key)?;
                    tables.insert(key.table.clone(), t);
                    PlannedOp {
                        key,
                        condition,
                        kind: PlannedKind::Check,
                    }
                }
            };
            planned.push(planned_op);
        }

        let mut seen = HashSet::with_capacity(planned.len());
        for op in &planned {
            if !seen.insert(op.key.clone()) {
                return Err(StoreError::Malformed(format!(
                    "atomic write addresses {} more than once",
                    op.key
                )));
            }
        }

        // Write-lock every touched table in name order (BTreeMap iteration
        // order), so concurrent atomic writes cannot deadlock.
        let mut guards: BTreeMap<&str, _> = tables
            .iter()
            .map(|(name, t)| (name.as_str(), t.rows.write()))
            .collect();

        // All conditions first.
        let mut failures = Vec::new();
        for op in &planned {
            let current = guards
                .get(op.key.table.as_str())
                .and_then(|rows| rows.get(&op.key.pk));
            if !op.condition.eval(current) {
                failures.push(ConditionFailure {
                    key: op.key.clone(),
                    current: current.cloned(),
                });
            }
        }
        if !failures.is_empty() {
            debug!(
                target: "keyspan::store",
                failed = failures.len(),
                "atomic write canceled"
            );
            return Err(StoreError::WriteCanceled { failures });
        }

        // Then all writes.
        for op in planned {
            let rows = match guards.get_mut(op.key.table.as_str()) {
                Some(rows) => rows,
                None => continue,
            };
            match op.kind {
                PlannedKind::Put(item) => {
                    rows.insert(op.key.pk, item);
                }
                PlannedKind::Update(update_ops) => {
                    let mut item = rows
                        .get(&op.key.pk)
                        .cloned()
                        .unwrap_or_else(|| Self::seed_item(&op.key));
                    apply_updates(&mut item, &update_ops);
                    rows.insert(op.key.pk, item);
                }
                PlannedKind::Delete => {
                    rows.remove(&op.key.pk);
                }
                PlannedKind::Check => {}
            }
        }
        Ok(())
    }

    async fn transact_get(&self, keys: &[ItemKey]) -> StoreResult<Vec<Option<AttrMap>>> {
        if keys.len() > self.limits.transact_get_items {
            return Err(StoreError::BatchTooLarge {
                count: keys.len(),
                limit: self.limits.transact_get_items,
            });
        }
        let mut tables: BTreeMap<String, Table> = BTreeMap::new();
        for key in keys {
            let t = self.table(&key.table)?;
            Self::check_key(&t.schema, key)?;
            tables.insert(key.table.clone(), t);
        }
        // Read-lock in name order; one consistent point in time across
        // every touched table.
        let guards: BTreeMap<&str, _> = tables
            .iter()
            .map(|(name, t)| (name.as_str(), t.rows.read()))
            .collect();
        Ok(keys
            .iter()
            .map(|key| {
                guards
                    .get(key.table.as_str())
                    .and_then(|rows| rows.get(&key.pk))
                    .cloned()
            })
            .collect())
    }

    async fn batch_get(
        &self,
        keys: &[ItemKey],
        _consistent: bool,
    ) -> StoreResult<Vec<Option<AttrMap>>> {
        if keys.len() > self.limits.batch_get_items {
            return Err(StoreError::BatchTooLarge {
                count: keys.len(),
                limit: self.limits.batch_get_items,
            });
        }
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let t = self.table(&key.table)?;
            Self::check_key(&t.schema, key)?;
            out.push(t.rows.read().get(&key.pk).cloned());
        }
        Ok(out)
    }

    async fn scan_table(&self, table: &str, limit: Option<usize>) -> StoreResult<Vec<AttrMap>> {
        let t = self.table(table)?;
        let rows = t.rows.read();
        let take = limit.unwrap_or(usize::MAX);
        Ok(rows.values().take(take).cloned().collect())
    }

    async fn key_schema(&self, table: &str) -> StoreResult<Vec<String>> {
        Ok(self.table(table)?.schema.as_ref().clone())
    }

    fn limits(&self) -> StoreLimits {
        self.limits
    }
}
