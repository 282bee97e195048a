//! When to checkpoint.
//!
//! The aggregator never checkpoints on its own; callers ask the planner and
//! decide. Any satisfied threshold makes a checkpoint due.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Checkpoint once this long has passed since the last one.
    pub min_interval_ms: Option<u64>,
    /// Checkpoint once this many keys are pending.
    pub max_pending_keys: Option<usize>,
    /// Checkpoint once this many records were aggregated.
    pub max_records: Option<u64>,
}

impl CheckpointPolicy {
    pub fn every_ms(interval_ms: u64) -> Self {
        Self {
            min_interval_ms: Some(interval_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointPlanner {
    policy: CheckpointPolicy,
    last_checkpoint_ns: u64,
    records_since: u64,
}

impl CheckpointPlanner {
    pub fn new(policy: CheckpointPolicy, now_ns: u64) -> Self {
        Self {
            policy,
            last_checkpoint_ns: now_ns,
            records_since: 0,
        }
    }

    pub fn observe(&mut self, records: u64) {
        self.records_since = self.records_since.saturating_add(records);
    }

    pub fn should_checkpoint(&self, now_ns: u64, pending_keys: usize) -> bool {
        let mut due = false;
        if let Some(max_records) = self.policy.max_records {
            due |= self.records_since >= max_records;
        }
        if let Some(max_keys) = self.policy.max_pending_keys {
            due |= pending_keys >= max_keys;
        }
        if let Some(interval_ms) = self.policy.min_interval_ms {
            let elapsed_ns = now_ns.saturating_sub(self.last_checkpoint_ns);
            due |= elapsed_ns >= interval_ms.saturating_mul(1_000_000);
        }
        due
    }

    pub fn mark_checkpoint(&mut self, now_ns: u64) {
        self.last_checkpoint_ns = now_ns;
        self.records_since = 0;
    }
}
