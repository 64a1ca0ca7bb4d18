//! Cross-worker metric aggregation.
//!
//! The aggregator runs as a background task in the coordinator, draining every
//! worker's ring buffer once per tick. Latencies feed two histogram sets: the
//! tick-local set is reset after each [`MetricSnapshot`], the cumulative set
//! survives the whole run and produces the final summary. Snapshots are
//! appended to the in-memory store and handed to the `on_snapshot` callback.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::prelude::*;

use crate::histogram::LatencyHistogram;
use crate::metrics::{
    EndpointLabel, EndpointSnapshot, ErrorCategory, MetricSnapshot, MetricStore, RequestMetric,
    SnapshotDiagnostics,
};
use crate::ring::RingConsumer;
use crate::util;

/// Callback invoked with every snapshot, exactly once per tick. Receives the
/// snapshot by value; must not block longer than the tick interval.
pub type SnapshotCallback = Box<dyn FnMut(MetricSnapshot) + Send>;

/// How far behind the scheduler's deadline each drain runs, so the
/// coordinator has distributed the tick's target before the snapshot reads it.
const SNAPSHOT_PHASE_LAG: Duration = Duration::from_millis(10);

/// Shared gauges and settings handed to the aggregator task.
pub(crate) struct AggregatorConfig {
    pub tick_interval: f64,
    pub epoch: Instant,
    /// Current scheduler target, maintained by the coordinator.
    pub target_users: Arc<AtomicUsize>,
    /// Label registrations dropped by workers on a full channel.
    pub dropped_labels: Arc<AtomicU64>,
}

/// Observed virtual users, summed over the workers' ring gauges.
fn observed_active_users(consumers: &[RingConsumer]) -> usize {
    consumers.iter().map(RingConsumer::active_users).sum()
}

/// Everything the aggregator hands back when it stops.
pub(crate) struct AggregatorOutput {
    pub snapshots: Vec<MetricSnapshot>,
    pub summary: MetricSnapshot,
}

/// Counters and histograms for one aggregation scope (tick-local or
/// cumulative).
#[derive(Default)]
struct AggregateState {
    histogram: LatencyHistogram,
    endpoints: HashMap<u64, EndpointState>,
    requests: u64,
    errors: u64,
    errors_by_status: BTreeMap<u16, u64>,
    errors_by_category: BTreeMap<ErrorCategory, u64>,
}

#[derive(Default)]
struct EndpointState {
    histogram: LatencyHistogram,
    requests: u64,
    errors: u64,
}

impl AggregateState {
    fn record(&mut self, metric: &RequestMetric) {
        let latency = f64::from(metric.latency_ms);
        self.histogram.record(latency);
        self.requests += 1;

        let endpoint = self.endpoints.entry(metric.name_hash).or_default();
        endpoint.histogram.record(latency);
        endpoint.requests += 1;

        if metric.is_error() {
            self.errors += 1;
            endpoint.errors += 1;
            if metric.status_code >= 400 {
                *self.errors_by_status.entry(metric.status_code).or_insert(0) += 1;
            }
            *self
                .errors_by_category
                .entry(metric.error_category)
                .or_insert(0) += 1;
        }
    }

    fn reset(&mut self) {
        self.histogram.reset();
        self.endpoints.clear();
        self.requests = 0;
        self.errors = 0;
        self.errors_by_status.clear();
        self.errors_by_category.clear();
    }
}

/// Run the aggregation loop until the stop channel fires, then drain one last
/// time and return the collected time series plus the cumulative summary.
pub(crate) async fn aggregator_loop(
    config: AggregatorConfig,
    consumers: Vec<RingConsumer>,
    new_consumers: flume::Receiver<RingConsumer>,
    labels: flume::Receiver<EndpointLabel>,
    stop: flume::Receiver<()>,
    on_snapshot: Option<SnapshotCallback>,
) -> AggregatorOutput {
    Aggregator {
        config,
        consumers,
        new_consumers,
        labels,
        on_snapshot,
        store: MetricStore::new(),
        tick_state: AggregateState::default(),
        cumulative_state: AggregateState::default(),
        resolved: HashMap::new(),
        collisions: 0,
        dropped_records: 0,
        scratch: Vec::new(),
        last_snapshot_elapsed: 0.0,
        tick_number: 0,
    }
    .run(stop)
    .await
}

struct Aggregator {
    config: AggregatorConfig,
    consumers: Vec<RingConsumer>,
    new_consumers: flume::Receiver<RingConsumer>,
    labels: flume::Receiver<EndpointLabel>,
    on_snapshot: Option<SnapshotCallback>,
    store: MetricStore,
    tick_state: AggregateState,
    cumulative_state: AggregateState,
    resolved: HashMap<u64, String>,
    collisions: u64,
    dropped_records: u64,
    scratch: Vec<RequestMetric>,
    last_snapshot_elapsed: f64,
    tick_number: u64,
}

impl Aggregator {
    async fn run(mut self, stop: flume::Receiver<()>) -> AggregatorOutput {
        loop {
            let deadline = self.config.epoch
                + Duration::from_secs_f64(self.tick_number as f64 * self.config.tick_interval)
                + SNAPSHOT_PHASE_LAG;
            let stopping = tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => false,
                _ = stop.recv_async() => true,
            };
            if stopping {
                // Ticks whose deadlines already passed are still emitted, so
                // a clean N-second run always yields its full schedule of
                // snapshots regardless of when the stop signal lands.
                let now = util::monotonic_seconds(self.config.epoch);
                while self.tick_number as f64 * self.config.tick_interval <= now {
                    self.process_tick();
                }
                debug!("aggregator stopping after {} ticks", self.tick_number);
                break;
            }
            self.process_tick();
        }
        self.finalize()
    }

    /// Drain every ring and emit the snapshot for the current tick.
    fn process_tick(&mut self) {
        self.drain();
        let elapsed = self.tick_number as f64 * self.config.tick_interval;
        let snapshot = self.snapshot(elapsed, self.config.tick_interval, &self.tick_state);
        self.store.append(snapshot.clone());
        if let Some(callback) = self.on_snapshot.as_mut() {
            callback(snapshot);
        }
        self.tick_state.reset();
        self.last_snapshot_elapsed = elapsed;
        self.tick_number += 1;
    }

    /// Pull registrations and ring contents into the tick and cumulative
    /// state.
    fn drain(&mut self) {
        // A worker restarted mid-run contributes through a freshly registered
        // consumer; its predecessor's ring is drained one last time and
        // retired so its gauges no longer count.
        while let Ok(consumer) = self.new_consumers.try_recv() {
            info!("registering ring buffer for worker {}", consumer.worker_id());
            let replaced_id = consumer.worker_id();
            for old in self
                .consumers
                .iter_mut()
                .filter(|old| old.worker_id() == replaced_id)
            {
                self.dropped_records += old.drain(&mut self.scratch);
            }
            self.consumers.retain(|old| old.worker_id() != replaced_id);
            self.consumers.push(consumer);
        }
        self.dropped_records += drain_rings(&mut self.consumers, &mut self.scratch);
        resolve_labels(&self.labels, &mut self.resolved, &mut self.collisions);
        for metric in self.scratch.drain(..) {
            self.tick_state.record(&metric);
            self.cumulative_state.record(&metric);
        }
    }

    fn snapshot(&self, elapsed: f64, interval: f64, state: &AggregateState) -> MetricSnapshot {
        build_snapshot(
            state,
            &self.resolved,
            elapsed,
            interval,
            self.config.target_users.load(Ordering::Relaxed),
            observed_active_users(&self.consumers),
            (self.cumulative_state.requests, self.cumulative_state.errors),
            SnapshotDiagnostics {
                dropped_records: self.dropped_records,
                label_collisions: self.collisions,
                dropped_labels: self.config.dropped_labels.load(Ordering::Relaxed),
            },
        )
    }

    /// Final drain so records completed during shutdown are never lost, then
    /// the cumulative summary.
    fn finalize(mut self) -> AggregatorOutput {
        self.drain();
        let elapsed = util::monotonic_seconds(self.config.epoch);

        // Flush a trailing partial tick if anything completed since the last
        // snapshot. A run stopped before its first tick still gets one at t=0.
        if self.tick_state.requests > 0 || self.store.is_empty() {
            let snapshot_elapsed = if self.store.is_empty() { 0.0 } else { elapsed };
            let interval = (elapsed - self.last_snapshot_elapsed).max(0.001);
            let snapshot = self.snapshot(snapshot_elapsed, interval, &self.tick_state);
            self.store.append(snapshot.clone());
            if let Some(callback) = self.on_snapshot.as_mut() {
                callback(snapshot);
            }
            self.tick_state.reset();
        }

        let mut summary = self.snapshot(elapsed, elapsed.max(0.001), &self.cumulative_state);
        summary.active_users = 0;

        AggregatorOutput {
            snapshots: self.store.into_snapshots(),
            summary,
        }
    }
}

/// Drain every ring into `scratch`, returning records lost to overflow.
fn drain_rings(consumers: &mut [RingConsumer], scratch: &mut Vec<RequestMetric>) -> u64 {
    let mut dropped = 0;
    for consumer in consumers.iter_mut() {
        let lost = consumer.drain(scratch);
        if lost > 0 {
            warn!(
                "worker {} ring buffer overflowed, {} records dropped",
                consumer.worker_id(),
                lost
            );
            dropped += lost;
        }
    }
    dropped
}

/// Pull pending label registrations. The first name registered for a hash is
/// authoritative; a different name arriving later is a collision and gets a
/// `#2` suffix in the log.
fn resolve_labels(
    labels: &flume::Receiver<EndpointLabel>,
    resolved: &mut HashMap<u64, String>,
    collisions: &mut u64,
) {
    while let Ok(label) = labels.try_recv() {
        match resolved.get(&label.hash) {
            Some(existing) if existing != &label.name => {
                *collisions += 1;
                warn!(
                    "endpoint label hash collision on {:#018x}: keeping '{}', suffixing '{}' as '{}#2'",
                    label.hash, existing, label.name, label.name
                );
            }
            Some(_) => (),
            None => {
                resolved.insert(label.hash, label.name);
            }
        }
    }
}

fn display_name(resolved: &HashMap<u64, String>, hash: u64) -> String {
    match resolved.get(&hash) {
        Some(name) => name.clone(),
        None => format!("unknown:{:016x}", hash),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_snapshot(
    state: &AggregateState,
    resolved: &HashMap<u64, String>,
    elapsed: f64,
    interval: f64,
    target_users: usize,
    active_users: usize,
    totals: (u64, u64),
    diagnostics: SnapshotDiagnostics,
) -> MetricSnapshot {
    let (total_requests, total_errors) = totals;
    let mut endpoints = BTreeMap::new();
    for (hash, endpoint_state) in &state.endpoints {
        let name = display_name(resolved, *hash);
        // One endpoint's aggregation failing must not drop the whole tick.
        match catch_unwind(AssertUnwindSafe(|| {
            endpoint_snapshot(&name, endpoint_state, interval)
        })) {
            Ok(endpoint) => {
                endpoints.insert(name, endpoint);
            }
            Err(_) => {
                error!("aggregation failed for endpoint {}, skipping this tick", name);
            }
        }
    }

    let error_rate = if state.requests > 0 {
        state.errors as f64 / state.requests as f64
    } else {
        0.0
    };

    MetricSnapshot {
        timestamp: Utc::now(),
        elapsed_seconds: elapsed,
        target_users,
        active_users,
        total_requests,
        requests_this_tick: state.requests,
        requests_per_second: state.requests as f64 / interval,
        latency_min: state.histogram.min().into(),
        latency_max: state.histogram.max().into(),
        latency_avg: state.histogram.mean().into(),
        latency_p50: state.histogram.percentile(50.0).into(),
        latency_p75: state.histogram.percentile(75.0).into(),
        latency_p90: state.histogram.percentile(90.0).into(),
        latency_p95: state.histogram.percentile(95.0).into(),
        latency_p99: state.histogram.percentile(99.0).into(),
        latency_p999: state.histogram.percentile(99.9).into(),
        total_errors,
        errors_this_tick: state.errors,
        error_rate,
        errors_by_status: state.errors_by_status.clone(),
        errors_by_category: state.errors_by_category.clone(),
        endpoints,
        diagnostics,
    }
}

fn endpoint_snapshot(name: &str, state: &EndpointState, interval: f64) -> EndpointSnapshot {
    let error_rate = if state.requests > 0 {
        state.errors as f64 / state.requests as f64
    } else {
        0.0
    };
    EndpointSnapshot {
        name: name.to_string(),
        request_count: state.requests,
        requests_per_second: state.requests as f64 / interval,
        error_count: state.errors,
        error_rate,
        latency_min: state.histogram.min().into(),
        latency_max: state.histogram.max().into(),
        latency_avg: state.histogram.mean().into(),
        latency_p50: state.histogram.percentile(50.0).into(),
        latency_p75: state.histogram.percentile(75.0).into(),
        latency_p90: state.histogram.percentile(90.0).into(),
        latency_p95: state.histogram.percentile(95.0).into(),
        latency_p99: state.histogram.percentile(99.0).into(),
    }
}
