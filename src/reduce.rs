//! Reduction policies: how one event becomes a delta and how deltas merge.
//!
//! Merges must be associative and commutative. Stores apply the same merge
//! when they fold a checkpointed delta into a stored row, so a delta written
//! twice would be counted twice; the aggregator never does that.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::InputEvent;

pub trait Reducer: Send + Sync {
    type Value: Clone + fmt::Debug + PartialEq + Send + Serialize + DeserializeOwned;

    /// Value a new key starts from.
    fn identity(&self) -> Self::Value;

    fn merge(&self, acc: &mut Self::Value, delta: &Self::Value);

    /// Delta contributed by one event, `None` when the event carries nothing
    /// this reducer can use.
    fn delta(&self, event: &InputEvent) -> Option<Self::Value>;

    fn name(&self) -> &'static str;
}

/// Counts events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Reducer for Count {
    type Value = u64;

    fn identity(&self) -> u64 {
        0
    }

    fn merge(&self, acc: &mut u64, delta: &u64) {
        *acc = acc.saturating_add(*delta);
    }

    fn delta(&self, _event: &InputEvent) -> Option<u64> {
        Some(1)
    }

    fn name(&self) -> &'static str {
        "count"
    }
}

/// Sums event values; events without a value are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Reducer for Sum {
    type Value = f64;

    fn identity(&self) -> f64 {
        0.0
    }

    fn merge(&self, acc: &mut f64, delta: &f64) {
        *acc += *delta;
    }

    fn delta(&self, event: &InputEvent) -> Option<f64> {
        event.value
    }

    fn name(&self) -> &'static str {
        "sum"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl Reducer for Max {
    type Value = f64;

    fn identity(&self) -> f64 {
        f64::NEG_INFINITY
    }

    fn merge(&self, acc: &mut f64, delta: &f64) {
        *acc = acc.max(*delta);
    }

    fn delta(&self, event: &InputEvent) -> Option<f64> {
        event.value
    }

    fn name(&self) -> &'static str {
        "max"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl Reducer for Min {
    type Value = f64;

    fn identity(&self) -> f64 {
        f64::INFINITY
    }

    fn merge(&self, acc: &mut f64, delta: &f64) {
        *acc = acc.min(*delta);
    }

    fn delta(&self, event: &InputEvent) -> Option<f64> {
        event.value
    }

    fn name(&self) -> &'static str {
        "min"
    }
}

/// Count, sum, min and max in one row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryValue {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl SummaryValue {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0 && self.min.is_some()).then(|| self.sum / self.count as f64)
    }
}

/// Every event counts; valued events also feed sum, min and max.
#[derive(Debug, Clone, Copy, Default)]
pub struct Summary;

impl Reducer for Summary {
    type Value = SummaryValue;

    fn identity(&self) -> SummaryValue {
        SummaryValue {
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    fn merge(&self, acc: &mut SummaryValue, delta: &SummaryValue) {
        acc.count = acc.count.saturating_add(delta.count);
        acc.sum += delta.sum;
        acc.min = match (acc.min, delta.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        acc.max = match (acc.max, delta.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn delta(&self, event: &InputEvent) -> Option<SummaryValue> {
        Some(SummaryValue {
            count: 1,
            sum: event.value.unwrap_or(0.0),
            min: event.value,
            max: event.value,
        })
    }

    fn name(&self) -> &'static str {
        "summary"
    }
}
