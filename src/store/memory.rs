use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::key::BucketKey;
use crate::reduce::Reducer;
use crate::store::{AggregateStore, InventoryEntry, ShardStatus, StoreResult};

/// One additive write as the store received it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWrite<V> {
    pub table: String,
    pub key: String,
    pub delta: V,
}

#[derive(Debug)]
struct Tables<V> {
    rows: HashMap<String, BTreeMap<String, V>>,
    inventory: BTreeMap<(String, String), InventoryEntry>,
    writes: Vec<StoredWrite<V>>,
}

/// In-process store. Rows are folded with the same reducer the aggregator
/// uses; every write is also kept in order for inspection.
pub struct MemoryStore<R: Reducer> {
    reducer: R,
    tables: Mutex<Tables<R::Value>>,
}

impl<R: Reducer> MemoryStore<R> {
    pub fn new(reducer: R) -> Self {
        Self {
            reducer,
            tables: Mutex::new(Tables {
                rows: HashMap::new(),
                inventory: BTreeMap::new(),
                writes: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Tables<R::Value>>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Current folded value of one row.
    pub fn row(&self, table: &str, key: &str) -> Option<R::Value> {
        let tables = self.lock().ok()?;
        tables.rows.get(table)?.get(key).cloned()
    }

    pub fn rows(&self, table: &str) -> BTreeMap<String, R::Value> {
        self.lock()
            .ok()
            .and_then(|tables| tables.rows.get(table).cloned())
            .unwrap_or_default()
    }

    /// Every update received for `table`, in arrival order.
    pub fn writes(&self, table: &str) -> Vec<StoredWrite<R::Value>> {
        self.lock()
            .map(|tables| {
                tables
                    .writes
                    .iter()
                    .filter(|write| write.table == table)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn shard(&self, table: &str, shard_id: &str) -> Option<InventoryEntry> {
        let tables = self.lock().ok()?;
        tables
            .inventory
            .get(&(table.to_string(), shard_id.to_string()))
            .cloned()
    }
}

impl<R: Reducer> AggregateStore<R::Value> for MemoryStore<R> {
    fn update(&self, table: &str, key: &BucketKey, delta: &R::Value) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let row = tables
            .rows
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| self.reducer.identity());
        self.reducer.merge(row, delta);
        tables.writes.push(StoredWrite {
            table: table.to_string(),
            key: key.to_string(),
            delta: delta.clone(),
        });
        Ok(())
    }

    fn set_shard_status(
        &self,
        table: &str,
        shard_id: &str,
        status: ShardStatus,
        at_ns: u64,
    ) -> StoreResult<()> {
        let mut tables = self.lock()?;
        tables.inventory.insert(
            (table.to_string(), shard_id.to_string()),
            InventoryEntry {
                shard_id: shard_id.to_string(),
                status,
                updated_ns: at_ns,
            },
        );
        Ok(())
    }
}
