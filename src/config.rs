//! Aggregator configuration.
//!
//! Loaded from JSON, or built in code:
//!
//! ```
//! use stream_aggregators::config::AggregatorConfig;
//! use stream_aggregators::horizon::{TimeHorizon, Timezone};
//!
//! let config = AggregatorConfig::new("page_views")
//!     .with_horizons(TimeHorizon::Hour.hierarchy_to(TimeHorizon::Month)?)
//!     .with_timezone(Timezone::Utc);
//! config.validate()?;
//! # Ok::<(), stream_aggregators::Error>(())
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::aggregator::CheckpointPolicy;
use crate::horizon::{TimeHorizon, Timezone};
use crate::key::{BucketKeyBuilder, KeyLayout};
use crate::{Error, Result};

/// What to do with a record whose events cannot be keyed or extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// Drop the record's contribution and report it in the batch result.
    #[default]
    Skip,
    /// Fail the whole batch; nothing from it is merged.
    FailBatch,
}

/// Configuration for one aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Backing store table; also the aggregator's identity.
    pub table_name: String,

    /// Horizons every event is bucketed at.
    /// Default: minute through forever
    pub horizons: Vec<TimeHorizon>,

    /// Character between the entity key and each horizon segment.
    /// Default: '|'
    pub separator: char,

    /// Offset bucket values are rendered in. `UTC` is the utc shift.
    /// Default: the offset each event carries
    pub timezone: Timezone,

    /// Default: one row per horizon
    pub key_layout: KeyLayout,

    /// Default: skip bad records
    pub reject_policy: RejectPolicy,

    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            table_name: "aggregates".to_string(),
            horizons: TimeHorizon::Minute.full_hierarchy(),
            separator: '|',
            timezone: Timezone::Recorded,
            key_layout: KeyLayout::PerHorizon,
            reject_policy: RejectPolicy::Skip,
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_horizons(mut self, horizons: impl IntoIterator<Item = TimeHorizon>) -> Self {
        self.horizons = horizons.into_iter().collect();
        self
    }

    pub fn with_timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_key_layout(mut self, layout: KeyLayout) -> Self {
        self.key_layout = layout;
        self
    }

    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_policy = policy;
        self
    }

    pub fn with_checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }

    /// # Errors
    ///
    /// - `Error::InvalidConfig`: empty table name, empty or duplicated
    ///   horizons, or a reserved separator
    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(Error::InvalidConfig("table name is empty".to_string()));
        }
        if self.horizons.is_empty() {
            return Err(Error::InvalidConfig("no horizons configured".to_string()));
        }
        let mut seen = HashSet::new();
        for horizon in &self.horizons {
            if !seen.insert(horizon) {
                return Err(Error::InvalidConfig(format!(
                    "horizon {horizon} configured twice"
                )));
            }
            if let TimeHorizon::MinutesGrouped(width) = horizon {
                if !width.divides_hour() {
                    log::warn!(
                        "grouped width {} does not divide 60; the last bucket of each hour is short",
                        width.minutes()
                    );
                }
            }
        }
        self.key_builder().map(|_| ())
    }

    pub fn key_builder(&self) -> Result<BucketKeyBuilder> {
        BucketKeyBuilder::new(self.separator, self.timezone)
    }
}
