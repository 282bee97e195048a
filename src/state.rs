//! Pending deltas accumulated since the last checkpoint.

use std::collections::BTreeMap;

use crate::key::BucketKey;
use crate::reduce::Reducer;

/// In-memory accumulator, one per shard.
///
/// Not synchronised itself; the aggregator guards it with a single mutex so
/// a drain never interleaves with a merge.
#[derive(Debug, Clone)]
pub struct AggregationState<V> {
    pending: BTreeMap<BucketKey, V>,
}

impl<V: Clone> AggregationState<V> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// Fold `delta` into the pending value for `key`, starting from the
    /// reducer's identity when the key is new.
    pub fn merge<R>(&mut self, reducer: &R, key: BucketKey, delta: &V)
    where
        R: Reducer<Value = V> + ?Sized,
    {
        let acc = self
            .pending
            .entry(key)
            .or_insert_with(|| reducer.identity());
        reducer.merge(acc, delta);
    }

    /// Remove and return every pending entry, ordered by key.
    pub fn drain_all(&mut self) -> BTreeMap<BucketKey, V> {
        std::mem::take(&mut self.pending)
    }

    /// Merge entries that were drained but never made durable back in.
    ///
    /// Merging (not overwriting) keeps contributions that arrived after the
    /// drain.
    pub fn restore<R, I>(&mut self, reducer: &R, entries: I)
    where
        R: Reducer<Value = V> + ?Sized,
        I: IntoIterator<Item = (BucketKey, V)>,
    {
        for (key, delta) in entries {
            self.merge(reducer, key, &delta);
        }
    }

    pub fn get(&self, key: &BucketKey) -> Option<&V> {
        self.pending.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

impl<V: Clone> Default for AggregationState<V> {
    fn default() -> Self {
        Self::new()
    }
}
