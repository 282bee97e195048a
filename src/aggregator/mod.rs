//! Per-shard aggregation lifecycle.
//!
//! ```text
//! Uninitialised -> Active { Idle | Checkpointing } -> ShuttingDown -> Terminated
//! ```
//!
//! `aggregate` only merges into pending state. Deltas reach the store at
//! `checkpoint` or at a flushing `shutdown`, as additive updates.
//!
//! Locking: `lifecycle` is always taken before `state`. A merge holds both,
//! so it can never land after shutdown has started; a checkpoint holds
//! `state` only while draining or restoring and writes with no lock held.

mod checkpoint;
mod report;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::{AggregatorConfig, RejectPolicy};
use crate::event::{EventExtractor, InputEvent, Record};
use crate::key::{BucketKey, BucketKeyBuilder};
use crate::reduce::Reducer;
use crate::state::AggregationState;
use crate::store::{AggregateStore, ShardStatus};
use crate::{Error, Result};

pub use checkpoint::{CheckpointPlanner, CheckpointPolicy};
pub use report::{AggregateReport, AggregatorStatus, CheckpointStats, Rejection, ShardContext};

/// Extractor for aggregators fed only through `aggregate_events`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtractor;

impl EventExtractor for NoExtractor {
    fn extract(&self, _record: &Record) -> Result<Vec<InputEvent>> {
        Err(Error::UnsupportedOperation(
            "aggregate(records) needs an event extractor",
        ))
    }
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialised,
    Active {
        shard_id: String,
        checkpointing: bool,
    },
    ShuttingDown {
        shard_id: String,
    },
    Terminated {
        shard_id: String,
    },
}

impl Lifecycle {
    fn require_active(&self) -> Result<()> {
        match self {
            Lifecycle::Active { .. } => Ok(()),
            Lifecycle::Uninitialised => Err(Error::NotInitialised),
            Lifecycle::ShuttingDown { .. } | Lifecycle::Terminated { .. } => {
                Err(Error::AlreadyTerminated)
            }
        }
    }

    fn status(&self) -> AggregatorStatus {
        match self {
            Lifecycle::Uninitialised => AggregatorStatus::Uninitialised,
            Lifecycle::Active {
                checkpointing: false,
                ..
            } => AggregatorStatus::Idle,
            Lifecycle::Active { .. } => AggregatorStatus::Checkpointing,
            Lifecycle::ShuttingDown { .. } => AggregatorStatus::ShuttingDown,
            Lifecycle::Terminated { .. } => AggregatorStatus::Terminated,
        }
    }

    fn shard_id(&self) -> Option<&str> {
        match self {
            Lifecycle::Uninitialised => None,
            Lifecycle::Active { shard_id, .. }
            | Lifecycle::ShuttingDown { shard_id }
            | Lifecycle::Terminated { shard_id } => Some(shard_id.as_str()),
        }
    }
}

type Contributions<V> = Vec<(BucketKey, V)>;

/// Aggregates one shard's stream into time-bucketed rows.
///
/// Every method takes `&self`: the shard worker calls `aggregate` while a
/// timer may call `checkpoint` concurrently.
pub struct StreamAggregator<R: Reducer, S, E = NoExtractor> {
    config: AggregatorConfig,
    keys: BucketKeyBuilder,
    reducer: R,
    store: S,
    extractor: E,
    clock: Arc<dyn Clock>,
    lifecycle: Mutex<Lifecycle>,
    /// Signalled whenever a checkpoint finishes.
    idle: Condvar,
    state: Mutex<AggregationState<R::Value>>,
    planner: Mutex<CheckpointPlanner>,
}

impl<R, S> StreamAggregator<R, S, NoExtractor>
where
    R: Reducer,
    S: AggregateStore<R::Value>,
{
    pub fn new(config: AggregatorConfig, reducer: R, store: S) -> Result<Self> {
        config.validate()?;
        let keys = config.key_builder()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let planner = CheckpointPlanner::new(config.checkpoint, clock.now());
        Ok(Self {
            config,
            keys,
            reducer,
            store,
            extractor: NoExtractor,
            clock,
            lifecycle: Mutex::new(Lifecycle::Uninitialised),
            idle: Condvar::new(),
            state: Mutex::new(AggregationState::new()),
            planner: Mutex::new(planner),
        })
    }
}

impl<R, S, E> StreamAggregator<R, S, E>
where
    R: Reducer,
    S: AggregateStore<R::Value>,
    E: EventExtractor,
{
    pub fn with_extractor<X: EventExtractor>(self, extractor: X) -> StreamAggregator<R, S, X> {
        StreamAggregator {
            config: self.config,
            keys: self.keys,
            reducer: self.reducer,
            store: self.store,
            extractor,
            clock: self.clock,
            lifecycle: self.lifecycle,
            idle: self.idle,
            state: self.state,
            planner: self.planner,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.planner = Mutex::new(CheckpointPlanner::new(self.config.checkpoint, clock.now()));
        self.clock = clock;
        self
    }

    /// Backing store table; the aggregator's identity.
    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn status(&self) -> AggregatorStatus {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status()
    }

    /// Keys waiting for the next checkpoint.
    pub fn pending_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn context(&self) -> ShardContext {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let pending_keys = self.pending_keys();
        ShardContext {
            table_name: self.config.table_name.clone(),
            shard_id: lifecycle.shard_id().map(str::to_string),
            status: lifecycle.status(),
            pending_keys,
        }
    }

    /// Bind to `shard_id` and mark the shard online in the store inventory.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyInitialised` if already bound
    /// - `Error::AlreadyTerminated` after shutdown
    /// - `Error::Store` if the inventory write fails; the aggregator stays
    ///   uninitialised and the call may be retried
    pub fn initialise(&self, shard_id: &str) -> Result<()> {
        if shard_id.is_empty() {
            return Err(Error::InvalidConfig("shard id is empty".to_string()));
        }
        let mut lifecycle = self.lock_lifecycle()?;
        match &*lifecycle {
            Lifecycle::Uninitialised => {}
            Lifecycle::Active { .. } | Lifecycle::ShuttingDown { .. } => {
                return Err(Error::AlreadyInitialised)
            }
            Lifecycle::Terminated { .. } => return Err(Error::AlreadyTerminated),
        }

        let now = self.clock.now();
        self.store
            .set_shard_status(self.table_name(), shard_id, ShardStatus::Online, now)?;
        self.lock_planner()?.mark_checkpoint(now);
        *lifecycle = Lifecycle::Active {
            shard_id: shard_id.to_string(),
            checkpointing: false,
        };
        log::info!(
            "aggregator {}: shard {shard_id} online ({} horizons, reducer {})",
            self.table_name(),
            self.config.horizons.len(),
            self.reducer.name()
        );
        Ok(())
    }

    /// Extract events from each record and merge their deltas.
    ///
    /// A record whose events cannot be extracted or keyed is handled per
    /// the configured `RejectPolicy`. With `FailBatch` nothing from the
    /// batch is merged.
    pub fn aggregate(&self, records: &[Record]) -> Result<AggregateReport> {
        self.lock_lifecycle()?.require_active()?;

        let mut report = AggregateReport {
            records: records.len(),
            ..AggregateReport::default()
        };
        let mut contributions = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let resolved = self
                .extractor
                .extract(record)
                .and_then(|events| self.contributions(&events));
            match resolved {
                Ok((events, keyed)) => {
                    report.events += events;
                    contributions.extend(keyed);
                }
                Err(err @ Error::UnsupportedOperation(_)) => return Err(err),
                Err(err) => {
                    let sequence = Some(record.sequence_number.as_str());
                    self.reject(&mut report, index, sequence, err)?
                }
            }
        }

        self.merge_all(contributions, &mut report)?;
        Ok(report)
    }

    /// Merge already-extracted events. Each event is its own unit of
    /// rejection.
    pub fn aggregate_events(&self, events: &[InputEvent]) -> Result<AggregateReport> {
        self.lock_lifecycle()?.require_active()?;

        let mut report = AggregateReport {
            records: events.len(),
            ..AggregateReport::default()
        };
        let mut contributions = Vec::new();
        for (index, event) in events.iter().enumerate() {
            match self.contributions(std::slice::from_ref(event)) {
                Ok((counted, keyed)) => {
                    report.events += counted;
                    contributions.extend(keyed);
                }
                Err(err) => self.reject(&mut report, index, None, err)?,
            }
        }

        self.merge_all(contributions, &mut report)?;
        Ok(report)
    }

    /// Drain pending state and write every delta to the store.
    ///
    /// On a store failure the deltas not yet written are merged back into
    /// pending state and `Error::CheckpointFailed` is returned; the caller
    /// may retry. Deltas already written are not restored, so a retry never
    /// counts them twice.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        {
            let mut lifecycle = self.lock_lifecycle()?;
            lifecycle.require_active()?;
            if let Lifecycle::Active { checkpointing, .. } = &mut *lifecycle {
                if *checkpointing {
                    return Err(Error::CheckpointInProgress);
                }
                *checkpointing = true;
            }
        }

        let result = self.flush();
        let finished = self.finish_checkpoint();
        let stats = result.and_then(|stats| finished.map(|()| stats))?;
        self.lock_planner()?.mark_checkpoint(self.clock.now());
        Ok(stats)
    }

    /// Checkpoint if the configured policy says one is due.
    pub fn checkpoint_if_due(&self) -> Result<Option<CheckpointStats>> {
        let pending = self.pending_keys();
        let due = self
            .lock_planner()?
            .should_checkpoint(self.clock.now(), pending);
        if !due {
            return Ok(None);
        }
        self.checkpoint().map(Some)
    }

    /// Stop aggregating, optionally writing pending state first, and mark
    /// the shard offline.
    ///
    /// Waits for an in-flight checkpoint. Always ends in `Terminated`; if the
    /// final flush fails its deltas are dropped (and logged) and the error is
    /// returned after the shard is marked offline.
    pub fn shutdown(&self, flush: bool) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle()?;
        let shard_id = loop {
            match &*lifecycle {
                Lifecycle::Active {
                    checkpointing: false,
                    shard_id,
                } => break shard_id.clone(),
                Lifecycle::Active { .. } => {}
                Lifecycle::Uninitialised => return Err(Error::NotInitialised),
                Lifecycle::ShuttingDown { .. } | Lifecycle::Terminated { .. } => {
                    return Err(Error::AlreadyTerminated)
                }
            }
            lifecycle = self
                .idle
                .wait(lifecycle)
                .map_err(|_| Error::Poisoned("lifecycle"))?;
        };
        *lifecycle = Lifecycle::ShuttingDown {
            shard_id: shard_id.clone(),
        };
        drop(lifecycle);

        let table = self.table_name();
        let flushed = if flush { self.flush().map(|_| ()) } else { Ok(()) };

        let discarded = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain_all()
            .len();
        if discarded > 0 {
            log::warn!(
                "aggregator {table}: discarded {discarded} pending keys on shutdown of shard {shard_id}"
            );
        }

        let offline = self
            .store
            .set_shard_status(table, &shard_id, ShardStatus::Offline, self.clock.now())
            .map_err(Error::from);

        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Terminated {
            shard_id: shard_id.clone(),
        };
        self.idle.notify_all();
        log::info!("aggregator {table}: shard {shard_id} offline");

        flushed?;
        offline
    }

    /// Keyed deltas of `events`, with the number of events that produced one.
    fn contributions(&self, events: &[InputEvent]) -> Result<(usize, Contributions<R::Value>)> {
        let horizons = &self.config.horizons;
        let mut out = Vec::with_capacity(events.len() * horizons.len());
        let mut counted = 0;
        for event in events {
            let Some(delta) = self.reducer.delta(event) else {
                continue;
            };
            counted += 1;
            let keys = self.keys.keys_for(
                &event.entity,
                event.event_time,
                horizons,
                self.config.key_layout,
            )?;
            out.extend(keys.into_iter().map(|key| (key, delta.clone())));
        }
        Ok((counted, out))
    }

    fn reject(
        &self,
        report: &mut AggregateReport,
        index: usize,
        sequence_number: Option<&str>,
        error: Error,
    ) -> Result<()> {
        log::warn!(
            "aggregator {}: rejected entry {index} (sequence {}): {error}",
            self.table_name(),
            sequence_number.unwrap_or("-")
        );
        match self.config.reject_policy {
            RejectPolicy::FailBatch => Err(error),
            RejectPolicy::Skip => {
                report.rejected.push(Rejection {
                    index,
                    sequence_number: sequence_number.map(str::to_string),
                    error,
                });
                Ok(())
            }
        }
    }

    fn merge_all(
        &self,
        contributions: Contributions<R::Value>,
        report: &mut AggregateReport,
    ) -> Result<()> {
        {
            let lifecycle = self.lock_lifecycle()?;
            lifecycle.require_active()?;
            let mut state = self.lock_state()?;
            report.contributions = contributions.len();
            for (key, delta) in contributions {
                state.merge(&self.reducer, key, &delta);
            }
        }
        self.lock_planner()?.observe(report.records as u64);
        Ok(())
    }

    fn flush(&self) -> Result<CheckpointStats> {
        let started = Instant::now();
        let table = self.table_name();
        let drained = self.lock_state()?.drain_all();
        if drained.is_empty() {
            log::debug!("aggregator {table}: nothing to checkpoint");
            return Ok(CheckpointStats {
                keys_written: 0,
                elapsed: started.elapsed(),
            });
        }

        let total = drained.len();
        let mut pending = drained.into_iter();
        let mut written = 0;
        while let Some((key, delta)) = pending.next() {
            if let Err(source) = self.store.update(table, &key, &delta) {
                let unwritten: Vec<_> = std::iter::once((key, delta))
                    .chain(pending.by_ref())
                    .collect();
                let restored = unwritten.len();
                self.lock_state()?.restore(&self.reducer, unwritten);
                log::warn!(
                    "aggregator {table}: checkpoint failed after {written}/{total} writes, restored {restored} deltas: {source}"
                );
                return Err(Error::CheckpointFailed {
                    written,
                    restored,
                    source,
                });
            }
            written += 1;
        }
        self.store.sync(table)?;

        let elapsed = started.elapsed();
        log::info!("aggregator {table}: checkpointed {written} keys in {elapsed:?}");
        Ok(CheckpointStats {
            keys_written: written,
            elapsed,
        })
    }

    fn finish_checkpoint(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle()?;
        if let Lifecycle::Active { checkpointing, .. } = &mut *lifecycle {
            *checkpointing = false;
        }
        self.idle.notify_all();
        Ok(())
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
        self.lifecycle
            .lock()
            .map_err(|_| Error::Poisoned("lifecycle"))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, AggregationState<R::Value>>> {
        self.state.lock().map_err(|_| Error::Poisoned("state"))
    }

    fn lock_planner(&self) -> Result<MutexGuard<'_, CheckpointPlanner>> {
        self.planner.lock().map_err(|_| Error::Poisoned("planner"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::event::{JsonExtractor, TimeFormat};
    use crate::horizon::{TimeHorizon, Timezone};
    use crate::key::KeyLayout;
    use crate::reduce::{Count, Sum};
    use crate::store::{MemoryStore, StoreResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn minute_config() -> AggregatorConfig {
        AggregatorConfig::new("clicks").with_horizons([TimeHorizon::Minute])
    }

    type Counter = StreamAggregator<Count, Arc<MemoryStore<Count>>>;

    fn counter(config: AggregatorConfig) -> (Arc<MemoryStore<Count>>, Counter) {
        let store = Arc::new(MemoryStore::new(Count));
        let aggregator =
            StreamAggregator::new(config, Count, Arc::clone(&store)).expect("valid config");
        (store, aggregator)
    }

    fn event(entity: &str, at: OffsetDateTime) -> InputEvent {
        InputEvent::new(entity, at)
    }

    /// Fails the `fail_on`-th update (1-based) once, then behaves.
    struct FlakyStore {
        inner: MemoryStore<Sum>,
        updates: AtomicUsize,
        fail_on: usize,
    }

    impl AggregateStore<f64> for FlakyStore {
        fn update(&self, table: &str, key: &BucketKey, delta: &f64) -> StoreResult<()> {
            let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(StoreError::Unavailable("throttled".to_string()));
            }
            self.inner.update(table, key, delta)
        }

        fn set_shard_status(
            &self,
            table: &str,
            shard_id: &str,
            status: ShardStatus,
            at_ns: u64,
        ) -> StoreResult<()> {
            self.inner.set_shard_status(table, shard_id, status, at_ns)
        }
    }

    #[test]
    fn three_events_in_one_minute_become_one_write() {
        let (store, aggregator) = counter(minute_config());
        aggregator.initialise("S1").expect("initialise");

        let events = [
            event("E1", datetime!(2024-01-29 15:42:01 UTC)),
            event("E1", datetime!(2024-01-29 15:42:30 UTC)),
            event("E1", datetime!(2024-01-29 15:42:59.999 UTC)),
        ];
        let report = aggregator.aggregate_events(&events).expect("aggregate events");
        assert_eq!(report.contributions, 3);
        assert!(store.writes("clicks").is_empty());

        let stats = aggregator.checkpoint().expect("checkpoint");
        assert_eq!(stats.keys_written, 1);
        let writes = store.writes("clicks");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].key, "E1|m-2024-01-29 15:42:00");
        assert_eq!(writes[0].delta, 3);

        aggregator.shutdown(false).expect("shutdown");
        assert_eq!(store.writes("clicks").len(), 1);
        assert_eq!(aggregator.status(), AggregatorStatus::Terminated);
    }

    #[test]
    fn lifecycle_misuse_is_rejected() {
        let (_store, aggregator) = counter(minute_config());
        let events = [event("E1", datetime!(2024-01-29 15:42 UTC))];

        assert!(matches!(
            aggregator.aggregate_events(&events),
            Err(Error::NotInitialised)
        ));
        assert!(matches!(aggregator.checkpoint(), Err(Error::NotInitialised)));
        assert!(matches!(aggregator.shutdown(true), Err(Error::NotInitialised)));

        aggregator.initialise("S1").expect("initialise");
        assert!(matches!(
            aggregator.initialise("S1"),
            Err(Error::AlreadyInitialised)
        ));

        aggregator.shutdown(true).expect("shutdown");
        assert!(matches!(
            aggregator.aggregate_events(&events),
            Err(Error::AlreadyTerminated)
        ));
        assert!(matches!(aggregator.checkpoint(), Err(Error::AlreadyTerminated)));
        assert!(matches!(aggregator.shutdown(true), Err(Error::AlreadyTerminated)));
        assert!(matches!(
            aggregator.initialise("S1"),
            Err(Error::AlreadyTerminated)
        ));
        assert_eq!(aggregator.table_name(), "clicks");
    }

    #[test]
    fn second_checkpoint_writes_nothing() {
        let (store, aggregator) = counter(minute_config());
        aggregator.initialise("S1").expect("initialise");
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");

        assert_eq!(aggregator.checkpoint().expect("checkpoint").keys_written, 1);
        assert_eq!(aggregator.checkpoint().expect("checkpoint").keys_written, 0);
        assert_eq!(store.writes("clicks").len(), 1);
        assert_eq!(store.row("clicks", "E1|m-2024-01-29 15:42:00"), Some(1));
    }

    #[test]
    fn failed_checkpoint_restores_unwritten_deltas() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(Sum),
            updates: AtomicUsize::new(0),
            fail_on: 2,
        });
        let config = AggregatorConfig::new("sums").with_horizons([TimeHorizon::Hour]);
        let aggregator =
            StreamAggregator::new(config, Sum, Arc::clone(&store)).expect("valid config");
        aggregator.initialise("S1").expect("initialise");

        let at = datetime!(2024-01-29 15:42 UTC);
        let batch: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|entity| event(entity, at).with_value(2.0))
            .collect();
        aggregator.aggregate_events(&batch).expect("aggregate events");

        match aggregator.checkpoint() {
            Err(Error::CheckpointFailed {
                written, restored, ..
            }) => {
                assert_eq!(written, 1);
                assert_eq!(restored, 2);
            }
            other => panic!("expected CheckpointFailed, got {other:?}"),
        }
        assert_eq!(aggregator.status(), AggregatorStatus::Idle);
        assert_eq!(aggregator.pending_keys(), 2);

        // arrives between the failure and the retry
        aggregator
            .aggregate_events(&[event("B", at).with_value(1.0)])
            .expect("aggregate events");
        assert_eq!(aggregator.checkpoint().expect("checkpoint").keys_written, 2);

        let rows = store.inner.rows("sums");
        assert_eq!(rows.get("A|H-2024-01-29 15:00:00"), Some(&2.0));
        assert_eq!(rows.get("B|H-2024-01-29 15:00:00"), Some(&3.0));
        assert_eq!(rows.get("C|H-2024-01-29 15:00:00"), Some(&2.0));
    }

    #[test]
    fn skip_policy_reports_bad_entities() {
        let (store, aggregator) = counter(minute_config());
        aggregator.initialise("S1").expect("initialise");
        let at = datetime!(2024-01-29 15:42 UTC);

        let report = aggregator
            .aggregate_events(&[event("E1", at), event("bad|entity", at), event("", at)])
            .expect("aggregate events");
        assert_eq!(report.events, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].index, 1);
        assert!(matches!(report.rejected[1].error, Error::InvalidKey(_)));

        aggregator.checkpoint().expect("checkpoint");
        assert_eq!(store.writes("clicks").len(), 1);
    }

    #[test]
    fn fail_batch_policy_merges_nothing() {
        let (_store, aggregator) =
            counter(minute_config().with_reject_policy(RejectPolicy::FailBatch));
        aggregator.initialise("S1").expect("initialise");
        let at = datetime!(2024-01-29 15:42 UTC);

        let result = aggregator.aggregate_events(&[event("E1", at), event("a|b", at)]);
        assert!(matches!(result, Err(Error::InvalidKey(_))));
        assert_eq!(aggregator.pending_keys(), 0);
    }

    #[test]
    fn per_horizon_layout_writes_one_row_per_horizon() {
        let horizons = TimeHorizon::Hour
            .hierarchy_to(TimeHorizon::Forever)
            .expect("valid range");
        let config = AggregatorConfig::new("clicks").with_horizons(horizons);
        let (store, aggregator) = counter(config);
        aggregator.initialise("S1").expect("initialise");
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");
        aggregator.shutdown(true).expect("shutdown");

        let rows = store.rows("clicks");
        assert_eq!(rows.len(), 5);
        assert_eq!(rows.get("E1|*-*"), Some(&1));
        assert_eq!(rows.get("E1|M-2024-01-01 00:00:00"), Some(&1));
    }

    #[test]
    fn combined_layout_writes_one_row() {
        let config = AggregatorConfig::new("clicks")
            .with_horizons([TimeHorizon::Minute, TimeHorizon::Forever])
            .with_key_layout(KeyLayout::Combined);
        let (store, aggregator) = counter(config);
        aggregator.initialise("S1").expect("initialise");
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");
        aggregator.checkpoint().expect("checkpoint");
        assert_eq!(
            store.row("clicks", "E1|m-2024-01-29 15:42:00|*-*"),
            Some(1)
        );
    }

    #[test]
    fn records_go_through_the_extractor() {
        let (store, aggregator) = counter(minute_config());
        let aggregator = aggregator
            .with_extractor(JsonExtractor::new(["user"]).time_field("time", TimeFormat::Rfc3339));
        aggregator.initialise("S1").expect("initialise");

        let arrival = datetime!(2024-01-29 15:42:10 UTC);
        let records = [
            Record::new("p", "1", arrival, r#"{"user":"u1","time":"2024-01-29T15:42:05Z"}"#),
            Record::new("p", "2", arrival, "not json"),
            Record::new("p", "3", arrival, r#"{"user":"u1"}"#),
        ];
        let report = aggregator.aggregate(&records).expect("aggregate records");
        assert_eq!(report.records, 3);
        assert_eq!(report.events, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].sequence_number.as_deref(), Some("2"));

        aggregator.checkpoint().expect("checkpoint");
        assert_eq!(store.row("clicks", "u1|m-2024-01-29 15:42:00"), Some(2));
    }

    #[test]
    fn out_of_range_times_reject_one_record() {
        let (store, aggregator) = counter(
            AggregatorConfig::new("clicks")
                .with_horizons([TimeHorizon::Day])
                .with_timezone(Timezone::Utc),
        );
        let aggregator = aggregator
            .with_extractor(JsonExtractor::new(["id"]).time_field("ts", TimeFormat::Rfc3339));
        aggregator.initialise("S1").expect("initialise");

        let arrival = datetime!(2024-01-29 15:42 UTC);
        let records = [
            Record::new("p", "1", arrival, r#"{"id":"a","ts":"9999-12-31T23:30:00-01:00"}"#),
            Record::new("p", "2", arrival, r#"{"id":"a","ts":"2024-01-29T15:42:00Z"}"#),
        ];
        let report = aggregator.aggregate(&records).expect("aggregate records");
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].sequence_number.as_deref(), Some("1"));
        assert!(matches!(report.rejected[0].error, Error::InvalidKey(_)));

        let (_store, epochs) = counter(minute_config());
        let epochs = epochs
            .with_extractor(JsonExtractor::new(["id"]).time_field("ts", TimeFormat::EpochSeconds));
        epochs.initialise("S1").expect("initialise");
        let batch: Vec<_> = ["\"inf\"", "\"NaN\"", "1e35", "1706543220"]
            .iter()
            .enumerate()
            .map(|(seq, ts)| {
                let payload = format!(r#"{{"id":"a","ts":{ts}}}"#);
                Record::new("p", seq.to_string(), arrival, payload)
            })
            .collect();
        let report = epochs.aggregate(&batch).expect("aggregate records");
        assert_eq!(report.rejected.len(), 3);
        assert!(report
            .rejected
            .iter()
            .all(|rejection| matches!(rejection.error, Error::Extract(_))));
        assert_eq!(report.events, 1);

        aggregator.checkpoint().expect("checkpoint");
        assert_eq!(store.row("clicks", "a|d-2024-01-29 00:00:00"), Some(1));
    }

    #[test]
    fn records_need_an_extractor() {
        let (_store, aggregator) = counter(minute_config());
        aggregator.initialise("S1").expect("initialise");
        let record = Record::new("p", "1", datetime!(2024-01-29 15:42 UTC), "{}");
        assert!(matches!(
            aggregator.aggregate(&[record]),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn shard_inventory_follows_lifecycle() {
        let (store, aggregator) = counter(minute_config());
        let clock = Arc::new(ManualClock::new(1_000));
        let aggregator = aggregator.with_clock(clock.clone());

        aggregator.initialise("S1").expect("initialise");
        let entry = store.shard("clicks", "S1").expect("inventory entry");
        assert_eq!(entry.status, ShardStatus::Online);
        assert_eq!(entry.updated_ns, 1_000);

        clock.advance(500);
        aggregator.shutdown(false).expect("shutdown");
        let entry = store.shard("clicks", "S1").expect("inventory entry");
        assert_eq!(entry.status, ShardStatus::Offline);
        assert_eq!(entry.updated_ns, 1_500);
    }

    #[test]
    fn shutdown_without_flush_discards_pending() {
        let (store, aggregator) = counter(minute_config());
        aggregator.initialise("S1").expect("initialise");
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");
        aggregator.shutdown(false).expect("shutdown");
        assert!(store.writes("clicks").is_empty());
        assert_eq!(aggregator.context().pending_keys, 0);
    }

    #[test]
    fn context_reports_shard_and_pending() {
        let (_store, aggregator) = counter(minute_config());
        assert_eq!(aggregator.context().shard_id, None);
        aggregator.initialise("S7").expect("initialise");
        aggregator
            .aggregate_events(&[
                event("E1", datetime!(2024-01-29 15:42 UTC)),
                event("E2", datetime!(2024-01-29 15:42 UTC)),
            ])
            .expect("aggregate events");

        let context = aggregator.context();
        assert_eq!(context.shard_id.as_deref(), Some("S7"));
        assert_eq!(context.status, AggregatorStatus::Idle);
        assert_eq!(context.pending_keys, 2);
        assert_eq!(context.table_name, "clicks");
    }

    #[test]
    fn checkpoint_if_due_follows_policy() {
        let policy = CheckpointPolicy {
            max_pending_keys: Some(2),
            ..CheckpointPolicy::default()
        };
        let (store, aggregator) = counter(minute_config().with_checkpoint(policy));
        aggregator.initialise("S1").expect("initialise");

        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");
        assert!(aggregator.checkpoint_if_due().expect("checkpoint if due").is_none());

        aggregator
            .aggregate_events(&[event("E2", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");
        let stats = aggregator
            .checkpoint_if_due()
            .expect("checkpoint if due")
            .expect("checkpoint is due");
        assert_eq!(stats.keys_written, 2);
        assert_eq!(store.writes("clicks").len(), 2);
    }

    /// Fails whichever operations are switched on. A status failure fires once.
    struct BrokenStore {
        inner: MemoryStore<Count>,
        fail_updates: AtomicBool,
        fail_sync: AtomicBool,
        fail_status: AtomicBool,
    }

    impl AggregateStore<u64> for BrokenStore {
        fn update(&self, table: &str, key: &BucketKey, delta: &u64) -> StoreResult<()> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("update refused".to_string()));
            }
            self.inner.update(table, key, delta)
        }

        fn set_shard_status(
            &self,
            table: &str,
            shard_id: &str,
            status: ShardStatus,
            at_ns: u64,
        ) -> StoreResult<()> {
            if self.fail_status.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("inventory refused".to_string()));
            }
            self.inner.set_shard_status(table, shard_id, status, at_ns)
        }

        fn sync(&self, _table: &str) -> StoreResult<()> {
            if self.fail_sync.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("sync refused".to_string()));
            }
            Ok(())
        }
    }

    fn broken() -> (Arc<BrokenStore>, StreamAggregator<Count, Arc<BrokenStore>>) {
        let store = Arc::new(BrokenStore {
            inner: MemoryStore::new(Count),
            fail_updates: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        });
        let aggregator = StreamAggregator::new(minute_config(), Count, Arc::clone(&store))
            .expect("valid config");
        (store, aggregator)
    }

    #[test]
    fn sync_failure_is_a_store_error_without_restore() {
        let (store, aggregator) = broken();
        aggregator.initialise("S1").expect("initialise");
        let at = datetime!(2024-01-29 15:42 UTC);
        aggregator
            .aggregate_events(&[event("E1", at), event("E2", at)])
            .expect("aggregate");

        store.fail_sync.store(true, Ordering::SeqCst);
        assert!(matches!(aggregator.checkpoint(), Err(Error::Store(_))));
        assert_eq!(aggregator.status(), AggregatorStatus::Idle);
        assert_eq!(aggregator.pending_keys(), 0);
        assert_eq!(store.inner.writes("clicks").len(), 2);

        store.fail_sync.store(false, Ordering::SeqCst);
        assert_eq!(aggregator.checkpoint().expect("retry").keys_written, 0);
        assert_eq!(store.inner.row("clicks", "E1|m-2024-01-29 15:42:00"), Some(1));
        assert_eq!(store.inner.row("clicks", "E2|m-2024-01-29 15:42:00"), Some(1));
    }

    #[test]
    fn failed_final_flush_still_terminates_offline() {
        let (store, aggregator) = broken();
        aggregator.initialise("S1").expect("initialise");
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate");

        store.fail_updates.store(true, Ordering::SeqCst);
        match aggregator.shutdown(true) {
            Err(Error::CheckpointFailed {
                written, restored, ..
            }) => {
                assert_eq!(written, 0);
                assert_eq!(restored, 1);
            }
            other => panic!("expected CheckpointFailed, got {other:?}"),
        }
        assert_eq!(aggregator.status(), AggregatorStatus::Terminated);
        assert_eq!(aggregator.pending_keys(), 0);
        assert!(store.inner.writes("clicks").is_empty());
        let entry = store.inner.shard("clicks", "S1").expect("inventory entry");
        assert_eq!(entry.status, ShardStatus::Offline);
        assert!(matches!(aggregator.shutdown(true), Err(Error::AlreadyTerminated)));
    }

    #[test]
    fn inventory_failure_leaves_initialise_retryable() {
        let (store, aggregator) = broken();
        store.fail_status.store(true, Ordering::SeqCst);

        let err = aggregator.initialise("S1").expect_err("inventory write fails");
        assert!(matches!(err, Error::Store(_)));
        assert!(err.is_retryable());
        assert_eq!(aggregator.status(), AggregatorStatus::Uninitialised);
        assert!(store.inner.shard("clicks", "S1").is_none());

        aggregator.initialise("S1").expect("retry initialise");
        assert_eq!(aggregator.status(), AggregatorStatus::Idle);
        let entry = store.inner.shard("clicks", "S1").expect("inventory entry");
        assert_eq!(entry.status, ShardStatus::Online);
    }

    #[test]
    fn events_without_a_delta_are_not_counted() {
        let store = Arc::new(MemoryStore::new(Sum));
        let config = AggregatorConfig::new("sums").with_horizons([TimeHorizon::Hour]);
        let aggregator =
            StreamAggregator::new(config, Sum, Arc::clone(&store)).expect("valid config");
        aggregator.initialise("S1").expect("initialise");

        let at = datetime!(2024-01-29 15:42 UTC);
        let report = aggregator
            .aggregate_events(&[event("A", at).with_value(4.0), event("A", at)])
            .expect("aggregate");
        assert_eq!(report.records, 2);
        assert_eq!(report.events, 1);
        assert_eq!(report.contributions, 1);
        assert!(report.is_clean());
    }

    /// Blocks inside `update` until released, to hold a checkpoint in flight.
    struct GateStore {
        inner: MemoryStore<Count>,
        entered: Mutex<bool>,
        entered_cv: Condvar,
        release: Mutex<bool>,
        release_cv: Condvar,
    }

    impl AggregateStore<u64> for GateStore {
        fn update(&self, table: &str, key: &BucketKey, delta: &u64) -> StoreResult<()> {
            *self.entered.lock().expect("lock") = true;
            self.entered_cv.notify_all();
            let mut release = self.release.lock().expect("lock");
            while !*release {
                release = self.release_cv.wait(release).expect("wait");
            }
            self.inner.update(table, key, delta)
        }

        fn set_shard_status(
            &self,
            table: &str,
            shard_id: &str,
            status: ShardStatus,
            at_ns: u64,
        ) -> StoreResult<()> {
            self.inner.set_shard_status(table, shard_id, status, at_ns)
        }
    }

    #[test]
    fn concurrent_checkpoint_and_shutdown_do_not_interleave() {
        let store = Arc::new(GateStore {
            inner: MemoryStore::new(Count),
            entered: Mutex::new(false),
            entered_cv: Condvar::new(),
            release: Mutex::new(false),
            release_cv: Condvar::new(),
        });
        let aggregator = Arc::new(
            StreamAggregator::new(minute_config(), Count, Arc::clone(&store))
                .expect("valid config"),
        );
        aggregator.initialise("S1").expect("initialise");
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");

        let background = {
            let aggregator = Arc::clone(&aggregator);
            thread::spawn(move || aggregator.checkpoint())
        };
        {
            let mut entered = store.entered.lock().expect("lock");
            while !*entered {
                entered = store.entered_cv.wait(entered).expect("wait");
            }
        }
        assert_eq!(aggregator.status(), AggregatorStatus::Checkpointing);
        assert!(matches!(
            aggregator.checkpoint(),
            Err(Error::CheckpointInProgress)
        ));

        // merges are still accepted while the checkpoint writes
        aggregator
            .aggregate_events(&[event("E1", datetime!(2024-01-29 15:42 UTC))])
            .expect("aggregate events");

        let shutdown = {
            let aggregator = Arc::clone(&aggregator);
            thread::spawn(move || aggregator.shutdown(true))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(aggregator.status(), AggregatorStatus::Checkpointing);

        *store.release.lock().expect("lock") = true;
        store.release_cv.notify_all();

        let stats = background
            .join()
            .expect("join checkpoint thread")
            .expect("background checkpoint");
        assert_eq!(stats.keys_written, 1);
        shutdown
            .join()
            .expect("join shutdown thread")
            .expect("shutdown after checkpoint");
        assert_eq!(store.inner.writes("clicks").len(), 2);
        assert_eq!(store.inner.row("clicks", "E1|m-2024-01-29 15:42:00"), Some(2));
    }
}
