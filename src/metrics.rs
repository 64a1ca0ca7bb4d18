//! Metrics collected and aggregated during load tests.
//!
//! Workers emit one [`RequestMetric`] per completed HTTP attempt. The
//! aggregator folds them into per-second [`MetricSnapshot`]s, and the
//! coordinator returns a [`TestResult`] holding the full time series plus a
//! cumulative summary when [`LoadTest::execute`](crate::LoadTest::execute)
//! completes.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Deserializer, Serialize};

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash an endpoint name with 64-bit FNV-1a.
pub fn fnv1a_hash(name: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// HTTP methods supported by the instrumented client, stored as a single byte
/// in the ring buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MethodCode {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl MethodCode {
    pub fn as_u8(self) -> u8 {
        match self {
            MethodCode::Get => 0,
            MethodCode::Post => 1,
            MethodCode::Put => 2,
            MethodCode::Patch => 3,
            MethodCode::Delete => 4,
            MethodCode::Head => 5,
        }
    }

    /// Total conversion so a torn or corrupted slot can never fail to decode.
    pub fn from_u8(value: u8) -> MethodCode {
        match value {
            1 => MethodCode::Post,
            2 => MethodCode::Put,
            3 => MethodCode::Patch,
            4 => MethodCode::Delete,
            5 => MethodCode::Head,
            _ => MethodCode::Get,
        }
    }
}

impl fmt::Display for MethodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodCode::Get => "GET",
            MethodCode::Post => "POST",
            MethodCode::Put => "PUT",
            MethodCode::Patch => "PATCH",
            MethodCode::Delete => "DELETE",
            MethodCode::Head => "HEAD",
        };
        write!(f, "{}", name)
    }
}

/// Why a request attempt is counted as an error.
///
/// Transport categories (`Connect` through `Write`, and `Other`) imply
/// `status_code == 0`; the HTTP categories imply a real status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    None,
    Connect,
    Timeout,
    Tls,
    Read,
    Write,
    HttpClientError,
    HttpServerError,
    Other,
}

impl ErrorCategory {
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCategory::None => 0,
            ErrorCategory::Connect => 1,
            ErrorCategory::Timeout => 2,
            ErrorCategory::Tls => 3,
            ErrorCategory::Read => 4,
            ErrorCategory::Write => 5,
            ErrorCategory::HttpClientError => 6,
            ErrorCategory::HttpServerError => 7,
            ErrorCategory::Other => 8,
        }
    }

    pub fn from_u8(value: u8) -> ErrorCategory {
        match value {
            0 => ErrorCategory::None,
            1 => ErrorCategory::Connect,
            2 => ErrorCategory::Timeout,
            3 => ErrorCategory::Tls,
            4 => ErrorCategory::Read,
            5 => ErrorCategory::Write,
            6 => ErrorCategory::HttpClientError,
            7 => ErrorCategory::HttpServerError,
            _ => ErrorCategory::Other,
        }
    }

    /// Derive the category for a response that did arrive.
    pub fn from_status(status_code: u16) -> ErrorCategory {
        match status_code {
            500..=599 => ErrorCategory::HttpServerError,
            400..=499 => ErrorCategory::HttpClientError,
            _ => ErrorCategory::None,
        }
    }
}

/// Raw metric emitted for every HTTP request attempt, exactly once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestMetric {
    /// Monotonic seconds since the start of the test, when the request began.
    pub timestamp: f64,
    /// FNV-1a hash of the logical endpoint name.
    pub name_hash: u64,
    /// The HTTP method used.
    pub method: MethodCode,
    /// HTTP response status code, 0 if transport failed before a response.
    pub status_code: u16,
    /// Response time in milliseconds.
    pub latency_ms: f32,
    /// Response body size in bytes, as reported by the server.
    pub content_length: u32,
    /// Which worker made the request.
    pub worker_id: u8,
    pub error_category: ErrorCategory,
}

impl RequestMetric {
    pub fn is_error(&self) -> bool {
        self.error_category != ErrorCategory::None
    }

    /// Either a response arrived (status > 0, category none/4xx/5xx) or the
    /// transport failed (status 0, transport category).
    pub fn is_consistent(&self) -> bool {
        if self.status_code > 0 {
            matches!(
                self.error_category,
                ErrorCategory::None
                    | ErrorCategory::HttpClientError
                    | ErrorCategory::HttpServerError
            )
        } else {
            matches!(
                self.error_category,
                ErrorCategory::Connect
                    | ErrorCategory::Timeout
                    | ErrorCategory::Tls
                    | ErrorCategory::Read
                    | ErrorCategory::Write
                    | ErrorCategory::Other
            )
        }
    }
}

/// Mapping from an endpoint name hash to its printable name, registered lazily
/// by workers the first time each name is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLabel {
    pub hash: u64,
    pub name: String,
    pub method: MethodCode,
}

impl EndpointLabel {
    pub fn new(name: &str, method: MethodCode) -> EndpointLabel {
        EndpointLabel {
            hash: fnv1a_hash(name),
            name: name.to_string(),
            method,
        }
    }
}

/// An `f64` which serializes NaN as `null` and deserializes `null` back to NaN.
///
/// Empty-histogram percentiles are NaN; JSON has no NaN literal.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize)]
pub struct NullableFloat(pub f64);

impl Deref for NullableFloat {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for NullableFloat {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<f64> for NullableFloat {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for NullableFloat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(Self(value.unwrap_or(f64::NAN)))
    }
}

impl fmt::Display for NullableFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Honor the caller's width so table columns stay aligned.
        if self.0.is_nan() {
            f.pad("-")
        } else {
            f.pad(&format!("{:.2}", self.0))
        }
    }
}

/// Aggregated metrics for a single endpoint within one snapshot interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    /// Printable endpoint name, or `unknown:<hex>` until the label resolves.
    pub name: String,
    pub request_count: u64,
    pub requests_per_second: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub latency_min: NullableFloat,
    pub latency_max: NullableFloat,
    pub latency_avg: NullableFloat,
    pub latency_p50: NullableFloat,
    pub latency_p75: NullableFloat,
    pub latency_p90: NullableFloat,
    pub latency_p95: NullableFloat,
    pub latency_p99: NullableFloat,
}

/// Aggregator health counters surfaced with every snapshot, cumulative since
/// the start of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiagnostics {
    /// Records lost to ring buffer overflow.
    pub dropped_records: u64,
    /// Endpoint label registrations whose hash collided with a different name.
    pub label_collisions: u64,
    /// Endpoint label registrations dropped by a full label channel.
    pub dropped_labels: u64,
}

/// Point-in-time aggregated metrics, emitted once per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Wall-clock time the snapshot was produced.
    pub timestamp: DateTime<Utc>,
    /// Seconds since the test started.
    pub elapsed_seconds: f64,
    /// Concurrency requested by the scheduler at this tick.
    pub target_users: usize,
    /// Virtual users actually running, summed over workers.
    pub active_users: usize,
    /// Requests completed since the start of the test.
    pub total_requests: u64,
    /// Requests completed during this tick interval.
    pub requests_this_tick: u64,
    /// Request rate over this tick interval.
    pub requests_per_second: f64,
    pub latency_min: NullableFloat,
    pub latency_max: NullableFloat,
    pub latency_avg: NullableFloat,
    pub latency_p50: NullableFloat,
    pub latency_p75: NullableFloat,
    pub latency_p90: NullableFloat,
    pub latency_p95: NullableFloat,
    pub latency_p99: NullableFloat,
    pub latency_p999: NullableFloat,
    /// Errors since the start of the test.
    pub total_errors: u64,
    /// Errors during this tick interval.
    pub errors_this_tick: u64,
    /// Fraction of this tick's requests that errored.
    pub error_rate: f64,
    /// This tick's error counts by HTTP status code (>= 400 only).
    pub errors_by_status: BTreeMap<u16, u64>,
    /// This tick's error counts by category.
    pub errors_by_category: BTreeMap<ErrorCategory, u64>,
    /// Per-endpoint breakdown for this tick, keyed by endpoint name.
    pub endpoints: BTreeMap<String, EndpointSnapshot>,
    pub diagnostics: SnapshotDiagnostics,
}

impl MetricSnapshot {
    /// An empty snapshot, used for ticks during which no requests completed.
    pub fn empty(
        timestamp: DateTime<Utc>,
        elapsed_seconds: f64,
        target_users: usize,
        active_users: usize,
    ) -> MetricSnapshot {
        MetricSnapshot {
            timestamp,
            elapsed_seconds,
            target_users,
            active_users,
            total_requests: 0,
            requests_this_tick: 0,
            requests_per_second: 0.0,
            latency_min: f64::NAN.into(),
            latency_max: f64::NAN.into(),
            latency_avg: f64::NAN.into(),
            latency_p50: f64::NAN.into(),
            latency_p75: f64::NAN.into(),
            latency_p90: f64::NAN.into(),
            latency_p95: f64::NAN.into(),
            latency_p99: f64::NAN.into(),
            latency_p999: f64::NAN.into(),
            total_errors: 0,
            errors_this_tick: 0,
            error_rate: 0.0,
            errors_by_status: BTreeMap::new(),
            errors_by_category: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            diagnostics: SnapshotDiagnostics::default(),
        }
    }
}

/// What a recorded scale step did to the number of virtual users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleAction {
    Increasing,
    Decreasing,
    Maintaining,
    Finished,
}

/// A historical record of a single scale step, stored on the [`TestResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleEvent {
    pub action: ScaleAction,
    /// A timestamp of when the step started.
    pub timestamp: DateTime<Utc>,
    /// The target number of users when the step started.
    pub users: usize,
}

impl ScaleEvent {
    pub(crate) fn step(action: ScaleAction, users: usize) -> ScaleEvent {
        ScaleEvent {
            action,
            timestamp: Utc::now(),
            users,
        }
    }
}

/// Worker lifecycle events recorded in the [`TestResult`] metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub worker_id: u8,
    pub timestamp: DateTime<Utc>,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerEventKind {
    /// Heartbeat went stale or the worker thread exited unexpectedly.
    Failed,
    /// A failed worker was replaced, permitted once per worker id per run.
    Restarted,
}

/// Complete result of a load test run, returned by
/// [`LoadTest::execute`](crate::LoadTest::execute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub scenario_name: String,
    /// Human-readable description of the load pattern that drove the test.
    pub pattern: String,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub duration_seconds: f64,
    /// One snapshot per tick, in chronological order.
    pub snapshots: Vec<MetricSnapshot>,
    /// Cumulative snapshot covering the entire run, computed from a parallel
    /// cumulative histogram rather than by merging per-tick snapshots.
    pub summary: MetricSnapshot,
    /// Scale steps performed, recorded when the target changed.
    pub history: Vec<ScaleEvent>,
    /// Worker failures and restarts.
    pub worker_events: Vec<WorkerEvent>,
    /// Populated when the run was aborted; collected snapshots are retained.
    pub failure: Option<String>,
}

impl fmt::Display for TestResult {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(fmt, "\n === PER ENDPOINT METRICS ===")?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>13} | {:>8} | {:>8}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(fmt, " {}", "-".repeat(78))?;
        let duration = self.duration_seconds.max(0.001);
        for name in self.summary.endpoints.keys().sorted() {
            let endpoint = &self.summary.endpoints[name];
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>13} | {:>8.2} | {:>8.2}",
                truncated(name, 24),
                endpoint.request_count.to_formatted_string(&Locale::en),
                endpoint.error_count.to_formatted_string(&Locale::en),
                endpoint.request_count as f64 / duration,
                endpoint.error_count as f64 / duration,
            )?;
        }
        writeln!(fmt, " {}", "-".repeat(78))?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>13} | {:>8.2} | {:>8.2}",
            "Aggregated",
            self.summary.total_requests.to_formatted_string(&Locale::en),
            self.summary.total_errors.to_formatted_string(&Locale::en),
            self.summary.total_requests as f64 / duration,
            self.summary.total_errors as f64 / duration,
        )?;

        writeln!(
            fmt,
            "\n {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
            "Name", "Avg (ms)", "Min", "Max", "50%", "95%", "99%"
        )?;
        writeln!(fmt, " {}", "-".repeat(88))?;
        for name in self.summary.endpoints.keys().sorted() {
            let endpoint = &self.summary.endpoints[name];
            writeln!(
                fmt,
                " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
                truncated(name, 24),
                endpoint.latency_avg,
                endpoint.latency_min,
                endpoint.latency_max,
                endpoint.latency_p50,
                endpoint.latency_p95,
                endpoint.latency_p99,
            )?;
        }
        writeln!(fmt, " {}", "-".repeat(88))?;
        writeln!(
            fmt,
            " {:<24} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8} | {:>8}",
            "Aggregated",
            self.summary.latency_avg,
            self.summary.latency_min,
            self.summary.latency_max,
            self.summary.latency_p50,
            self.summary.latency_p95,
            self.summary.latency_p99,
        )?;

        if let Some(failure) = &self.failure {
            writeln!(fmt, "\n test aborted: {}", failure)?;
        }
        Ok(())
    }
}

// Truncate names too long for the summary tables.
fn truncated(name: &str, max_length: usize) -> String {
    if name.len() > max_length {
        format!("{}..", &name[..max_length - 2])
    } else {
        name.to_string()
    }
}

/// Append-only, in-memory time series of snapshots.
///
/// Owned by the aggregator task while the test runs, then handed back by value
/// so the coordinator can assemble the [`TestResult`] without shared mutation.
#[derive(Debug, Default)]
pub struct MetricStore {
    snapshots: Vec<MetricSnapshot>,
}

impl MetricStore {
    pub fn new() -> MetricStore {
        MetricStore {
            snapshots: Vec::new(),
        }
    }

    pub fn append(&mut self, snapshot: MetricSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest(&self) -> Option<&MetricSnapshot> {
        self.snapshots.last()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn into_snapshots(self) -> Vec<MetricSnapshot> {
        self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a_hash(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_hash("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn category_round_trip() {
        for value in 0..=8 {
            assert_eq!(ErrorCategory::from_u8(value).as_u8(), value);
        }
        // Out-of-range bytes decode to Other rather than failing.
        assert_eq!(ErrorCategory::from_u8(200), ErrorCategory::Other);
    }

    #[test]
    fn category_from_status() {
        assert_eq!(ErrorCategory::from_status(200), ErrorCategory::None);
        assert_eq!(ErrorCategory::from_status(301), ErrorCategory::None);
        assert_eq!(ErrorCategory::from_status(404), ErrorCategory::HttpClientError);
        assert_eq!(ErrorCategory::from_status(500), ErrorCategory::HttpServerError);
        assert_eq!(ErrorCategory::from_status(503), ErrorCategory::HttpServerError);
    }

    #[test]
    fn metric_consistency() {
        let mut metric = RequestMetric {
            timestamp: 1.0,
            name_hash: fnv1a_hash("index"),
            method: MethodCode::Get,
            status_code: 200,
            latency_ms: 12.5,
            content_length: 1024,
            worker_id: 0,
            error_category: ErrorCategory::None,
        };
        assert!(metric.is_consistent());
        assert!(!metric.is_error());

        metric.status_code = 500;
        metric.error_category = ErrorCategory::HttpServerError;
        assert!(metric.is_consistent());
        assert!(metric.is_error());

        metric.status_code = 0;
        metric.error_category = ErrorCategory::Timeout;
        assert!(metric.is_consistent());

        // A timeout with a status code is contradictory.
        metric.status_code = 200;
        assert!(!metric.is_consistent());
    }

    #[test]
    fn nullable_float_serializes_nan_as_null() {
        let json = serde_json::to_string(&NullableFloat(f64::NAN)).unwrap();
        assert_eq!(json, "null");
        let json = serde_json::to_string(&NullableFloat(1.5)).unwrap();
        assert_eq!(json, "1.5");

        let value: NullableFloat = serde_json::from_str("null").unwrap();
        assert!(value.is_nan());
        let value: NullableFloat = serde_json::from_str("2.25").unwrap();
        assert_eq!(*value, 2.25);
    }

    #[test]
    fn snapshot_json_round_trip() {
        let mut snapshot = MetricSnapshot::empty(Utc::now(), 3.0, 10, 9);
        snapshot.requests_this_tick = 100;
        snapshot.total_requests = 250;
        snapshot.requests_per_second = 100.0;
        snapshot.errors_by_status.insert(500, 3);
        snapshot
            .errors_by_category
            .insert(ErrorCategory::Timeout, 2);
        snapshot.endpoints.insert(
            "index".to_string(),
            EndpointSnapshot {
                name: "index".to_string(),
                request_count: 100,
                requests_per_second: 100.0,
                error_count: 5,
                error_rate: 0.05,
                latency_min: 1.0.into(),
                latency_max: 50.0.into(),
                latency_avg: 10.0.into(),
                latency_p50: 8.0.into(),
                latency_p75: 12.0.into(),
                latency_p90: 20.0.into(),
                latency_p95: 30.0.into(),
                latency_p99: 45.0.into(),
            },
        );

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: MetricSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.requests_this_tick, 100);
        assert_eq!(decoded.errors_by_status[&500], 3);
        assert_eq!(decoded.errors_by_category[&ErrorCategory::Timeout], 2);
        assert_eq!(decoded.endpoints["index"].request_count, 100);
        // NaN percentiles survive as NaN through the null representation.
        assert!(decoded.latency_p999.is_nan());
    }

    #[test]
    fn test_result_json_round_trip() {
        let summary = MetricSnapshot::empty(Utc::now(), 5.0, 10, 10);
        let result = TestResult {
            scenario_name: "checkout".to_string(),
            pattern: "Constant: 10 users".to_string(),
            started: Utc::now(),
            ended: Utc::now(),
            duration_seconds: 5.0,
            snapshots: vec![MetricSnapshot::empty(Utc::now(), 0.0, 10, 0)],
            summary,
            history: vec![ScaleEvent::step(ScaleAction::Increasing, 10)],
            worker_events: Vec::new(),
            failure: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        let decoded: TestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.scenario_name, result.scenario_name);
        assert_eq!(decoded.snapshots.len(), 1);
        assert_eq!(decoded.history[0].users, 10);
    }

    #[test]
    fn store_is_append_only() {
        let mut store = MetricStore::new();
        assert!(store.is_empty());
        store.append(MetricSnapshot::empty(Utc::now(), 0.0, 0, 0));
        store.append(MetricSnapshot::empty(Utc::now(), 1.0, 5, 5));
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().unwrap().elapsed_seconds, 1.0);
        let snapshots = store.into_snapshots();
        assert_eq!(snapshots.len(), 2);
    }

    #[test]
    fn display_summary_table() {
        let summary = MetricSnapshot::empty(Utc::now(), 5.0, 10, 10);
        let result = TestResult {
            scenario_name: "browse".to_string(),
            pattern: "Constant: 10 users".to_string(),
            started: Utc::now(),
            ended: Utc::now(),
            duration_seconds: 5.0,
            snapshots: Vec::new(),
            summary,
            history: Vec::new(),
            worker_events: Vec::new(),
            failure: None,
        };
        let rendered = format!("{}", result);
        assert!(rendered.contains("PER ENDPOINT METRICS"));
        assert!(rendered.contains("Aggregated"));
    }
}
