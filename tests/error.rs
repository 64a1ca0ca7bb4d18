//! Error accounting: HTTP failures and transport timeouts land in the right
//! buckets and categories.

use httpmock::prelude::*;

mod common;

use loadforge::metrics::ErrorCategory;
use loadforge::prelude::*;

async fn index(session: &HttpSession) -> TaskResult {
    common::get_index(session).await
}

async fn error(session: &HttpSession) -> TaskResult {
    common::get_error(session).await
}

async fn slow(session: &HttpSession) -> TaskResult {
    common::get_slow(session).await
}

#[test]
fn errors_by_status_and_category() {
    let server = MockServer::start();
    common::mock_endpoints(&server);
    server.mock(|when, then| {
        when.method(GET).path(common::ERROR_PATH);
        then.status(500).body("boom");
    });
    // Server stalls longer than the client timeout: a timeout, not a status.
    server.mock(|when, then| {
        when.method(GET).path(common::SLOW_PATH);
        then.status(200).delay(std::time::Duration::from_secs(5));
    });

    let scenario = ScenarioDescriptor::new("Errors", &server.base_url())
        .register_task(scenario_task!(index).set_weight(4))
        .register_task(scenario_task!(error).set_weight(2))
        .register_task(scenario_task!(slow).set_weight(1))
        .set_think_time(0.0, 0.0);

    let result = LoadTest::initialize_with_config(
        scenario,
        LoadPattern::Constant { users: 6 },
        common::build_configuration(),
    )
    .set_run_time("3")
    .set_workers(1)
    .set_request_timeout(0.5)
    .set_grace_period(1.0)
    .execute()
    .expect("load test failed");

    let summary = &result.summary;
    assert!(summary.total_requests > 0);
    assert!(summary.total_errors > 0);
    assert!(summary.error_rate > 0.0 && summary.error_rate < 1.0);

    // Server 500s are counted by status and categorized as 5xx.
    assert!(summary.errors_by_status[&500] > 0);
    assert!(summary.errors_by_category[&ErrorCategory::HttpServerError] > 0);
    assert_eq!(
        summary.errors_by_status[&500],
        summary.errors_by_category[&ErrorCategory::HttpServerError]
    );

    // Timeouts carry no status code, only the category.
    assert!(summary.errors_by_category[&ErrorCategory::Timeout] > 0);

    // Category totals account for every error, status totals only for the
    // requests that produced a response.
    let by_category: u64 = summary.errors_by_category.values().sum();
    assert_eq!(by_category, summary.total_errors);
    let by_status: u64 = summary.errors_by_status.values().sum();
    assert!(by_status <= summary.total_errors);

    // The same invariants hold tick by tick.
    for snapshot in &result.snapshots {
        let by_category: u64 = snapshot.errors_by_category.values().sum();
        assert_eq!(by_category, snapshot.errors_this_tick);
    }

    // Per-endpoint error attribution.
    assert!(summary.endpoints["error"].error_rate > 0.99);
    assert!(summary.endpoints["index"].error_rate < 0.01);
}
