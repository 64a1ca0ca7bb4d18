//! The rate limiter bounds aggregate throughput regardless of user count.

use httpmock::prelude::*;

mod common;

use loadforge::prelude::*;

async fn index(session: &HttpSession) -> TaskResult {
    common::get_index(session).await
}

#[test]
fn throttled_request_rate() {
    let server = MockServer::start();
    common::mock_endpoints(&server);

    let rate_limit = 10.0;
    let run_seconds = 3;

    let scenario = ScenarioDescriptor::new("Throttled", &server.base_url())
        .register_task(scenario_task!(index))
        .set_think_time(0.0, 0.0);

    let result = LoadTest::initialize_with_config(
        scenario,
        LoadPattern::Constant { users: 5 },
        common::build_configuration(),
    )
    .set_run_time(&run_seconds.to_string())
    .set_workers(1)
    .set_rate_limit(rate_limit)
    .set_grace_period(1.0)
    .execute()
    .expect("load test failed");

    // Without the throttle, 5 users against a local mock would make thousands
    // of requests in 3 seconds. Admissions are bounded by burst + rate*window.
    let window = result.duration_seconds + 1.0;
    let admitted = result.summary.total_requests as f64;
    assert!(
        admitted <= rate_limit + rate_limit * window,
        "throttle failed: {} requests in {:.1}s",
        admitted,
        window
    );
    // The throttle slows traffic but doesn't stop it.
    assert!(admitted >= rate_limit, "only {} requests admitted", admitted);
}
