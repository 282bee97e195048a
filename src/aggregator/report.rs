use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::Error;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorStatus {
    Uninitialised,
    /// Active, no checkpoint in flight.
    Idle,
    /// Active, a checkpoint is writing to the store.
    Checkpointing,
    ShuttingDown,
    Terminated,
}

impl AggregatorStatus {
    pub fn is_active(self) -> bool {
        matches!(self, AggregatorStatus::Idle | AggregatorStatus::Checkpointing)
    }
}

impl fmt::Display for AggregatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregatorStatus::Uninitialised => "uninitialised",
            AggregatorStatus::Idle => "idle",
            AggregatorStatus::Checkpointing => "checkpointing",
            AggregatorStatus::ShuttingDown => "shutting_down",
            AggregatorStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one shard's aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardContext {
    pub table_name: String,
    pub shard_id: Option<String>,
    pub status: AggregatorStatus,
    pub pending_keys: usize,
}

/// A record (or event) whose contribution was dropped.
#[derive(Debug)]
pub struct Rejection {
    /// Position in the batch.
    pub index: usize,
    pub sequence_number: Option<String>,
    pub error: Error,
}

/// Outcome of one `aggregate` call.
#[derive(Debug, Default)]
pub struct AggregateReport {
    pub records: usize,
    /// Events from accepted records that produced a delta. An event the
    /// reducer ignores, such as one without a value under `Sum`, is not
    /// counted.
    pub events: usize,
    /// (key, delta) pairs merged into pending state.
    pub contributions: usize,
    pub rejected: Vec<Rejection>,
}

impl AggregateReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub keys_written: usize,
    pub elapsed: Duration,
}
