//! Per-shard stream aggregation into time-bucketed rows.
//!
//! Each event is bucketed at a set of time horizons (minute, hour, ...,
//! forever) and its delta merged into in-memory state under a
//! [`key::BucketKey`]. A [`StreamAggregator`] owns one shard and writes the
//! pending deltas to an [`store::AggregateStore`] as additive updates at
//! every checkpoint.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod horizon;
pub mod key;
pub mod reduce;
pub mod state;
pub mod store;

pub use aggregator::{
    AggregateReport, AggregatorStatus, CheckpointPlanner, CheckpointPolicy, CheckpointStats,
    ShardContext, StreamAggregator,
};
pub use config::{AggregatorConfig, RejectPolicy};
pub use error::{Error, Result, StoreError};
pub use horizon::{GroupWidth, TimeHorizon, Timezone};
pub use key::{BucketKey, BucketKeyBuilder, KeyLayout};
