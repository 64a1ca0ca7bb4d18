//! End-to-end load test of a simple two-task scenario against a mock server.

use httpmock::prelude::*;

mod common;

use loadforge::prelude::*;

#[test]
fn constant_load() {
    let server = MockServer::start();
    common::mock_endpoints(&server);

    let scenario = ScenarioDescriptor::new("LoadTest", &server.base_url())
        .register_task(scenario_task!(index).set_weight(10))
        .register_task(scenario_task!(about).set_weight(2))
        .set_think_time(0.0, 0.0);

    let result = LoadTest::initialize_with_config(
        scenario,
        LoadPattern::Constant { users: 10 },
        common::build_configuration(),
    )
    .set_run_time("3")
    .set_workers(2)
    .set_grace_period(1.0)
    .execute()
    .expect("load test failed");

    assert!(result.failure.is_none());
    assert_eq!(result.scenario_name, "LoadTest");
    assert_eq!(result.pattern, "Constant: 10 users");

    // One snapshot per tick from t=0 through t=3, plus an optional trailing
    // flush of requests that completed during shutdown.
    assert!(result.snapshots.len() >= 4, "{} snapshots", result.snapshots.len());
    assert_eq!(result.snapshots[0].elapsed_seconds, 0.0);

    // With zero think time against a local mock, traffic flows every tick.
    assert!(result.summary.total_requests > 10);
    assert_eq!(result.summary.total_errors, 0);
    for snapshot in &result.snapshots[1..4] {
        assert_eq!(snapshot.target_users, 10);
        assert!(snapshot.requests_per_second > 0.0);
        // Transient overshoot bounded by one user per worker.
        assert!(snapshot.active_users <= snapshot.target_users + 2);
    }

    // Endpoint labels resolve to their logical names, weighted 5:1.
    let index = &result.summary.endpoints["index"];
    let about = &result.summary.endpoints["about"];
    assert!(index.request_count > about.request_count);
    assert_eq!(
        index.request_count + about.request_count,
        result.summary.total_requests
    );

    // Per-tick endpoint counts always sum to the tick total.
    for snapshot in &result.snapshots {
        let by_endpoint: u64 = snapshot
            .endpoints
            .values()
            .map(|endpoint| endpoint.request_count)
            .sum();
        assert_eq!(by_endpoint, snapshot.requests_this_tick);
    }

    // Percentiles are monotone and bounded by the observed extremes.
    let summary = &result.summary;
    assert!(*summary.latency_min <= *summary.latency_p50);
    assert!(*summary.latency_p50 <= *summary.latency_p95);
    assert!(*summary.latency_p95 <= *summary.latency_p99);
    assert!(*summary.latency_p99 <= *summary.latency_p999);
    assert!(*summary.latency_p999 <= *summary.latency_max + 0.01);

    // Snapshot timestamps strictly increase.
    for pair in result.snapshots.windows(2) {
        assert!(pair[0].elapsed_seconds < pair[1].elapsed_seconds);
        assert!(pair[0].timestamp < pair[1].timestamp);
    }

    // Nothing was dropped at this modest rate.
    assert_eq!(result.summary.diagnostics.dropped_records, 0);
}

async fn index(session: &HttpSession) -> TaskResult {
    common::get_index(session).await
}

async fn about(session: &HttpSession) -> TaskResult {
    common::get_about(session).await
}

#[test]
fn snapshots_streamed_to_callback() {
    let server = MockServer::start();
    common::mock_endpoints(&server);

    let scenario = ScenarioDescriptor::new("Streaming", &server.base_url())
        .register_task(scenario_task!(index))
        .set_think_time(0.0, 0.0);

    let (sender, receiver) = std::sync::mpsc::channel();
    let result = LoadTest::initialize_with_config(
        scenario,
        LoadPattern::Constant { users: 2 },
        common::build_configuration(),
    )
    .set_run_time("2")
    .set_workers(1)
    .set_grace_period(1.0)
    .on_snapshot(move |snapshot| {
        let _ = sender.send(snapshot);
    })
    .execute()
    .expect("load test failed");

    let streamed: Vec<MetricSnapshot> = receiver.try_iter().collect();
    assert_eq!(streamed.len(), result.snapshots.len());
    assert_eq!(
        streamed.last().unwrap().total_requests,
        result.snapshots.last().unwrap().total_requests
    );
}

#[test]
fn json_round_trip() {
    let server = MockServer::start();
    common::mock_endpoints(&server);

    let scenario = ScenarioDescriptor::new("RoundTrip", &server.base_url())
        .register_task(scenario_task!(index))
        .set_think_time(0.0, 0.0);

    let result = LoadTest::initialize_with_config(
        scenario,
        LoadPattern::Constant { users: 2 },
        common::build_configuration(),
    )
    .set_run_time("1")
    .set_workers(1)
    .set_grace_period(1.0)
    .execute()
    .expect("load test failed");

    let json = serde_json::to_string(&result).expect("serialize");
    let decoded: TestResult = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded.summary.total_requests, result.summary.total_requests);
    assert_eq!(decoded.snapshots.len(), result.snapshots.len());
    assert_eq!(decoded.pattern, result.pattern);
}
