//! Backing store boundary.
//!
//! The aggregator only ever issues additive updates and inventory writes; it
//! never reads aggregate rows back and never overwrites them.

mod file;
mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::key::BucketKey;

pub use file::FileStore;
pub use memory::{MemoryStore, StoredWrite};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Whether an aggregator instance is processing a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Online,
    Offline,
}

/// One row of a table's shard inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub shard_id: String,
    pub status: ShardStatus,
    pub updated_ns: u64,
}

/// Durable destination of checkpointed deltas.
pub trait AggregateStore<V>: Send + Sync {
    /// Atomically merge `delta` into the row stored under `key`.
    fn update(&self, table: &str, key: &BucketKey, delta: &V) -> StoreResult<()>;

    /// Record a shard's aggregator as online or offline.
    fn set_shard_status(
        &self,
        table: &str,
        shard_id: &str,
        status: ShardStatus,
        at_ns: u64,
    ) -> StoreResult<()>;

    /// Make every update accepted so far durable.
    fn sync(&self, _table: &str) -> StoreResult<()> {
        Ok(())
    }
}

impl<V, T> AggregateStore<V> for Arc<T>
where
    T: AggregateStore<V> + ?Sized,
{
    fn update(&self, table: &str, key: &BucketKey, delta: &V) -> StoreResult<()> {
        (**self).update(table, key, delta)
    }

    fn set_shard_status(
        &self,
        table: &str,
        shard_id: &str,
        status: ShardStatus,
        at_ns: u64,
    ) -> StoreResult<()> {
        (**self).set_shard_status(table, shard_id, status, at_ns)
    }

    fn sync(&self, table: &str) -> StoreResult<()> {
        (**self).sync(table)
    }
}
