//! Scaling the virtual user fleet up and down mid-run.

use httpmock::prelude::*;

mod common;

use loadforge::metrics::ScaleAction;
use loadforge::prelude::*;

async fn index(session: &HttpSession) -> TaskResult {
    common::get_index(session).await
}

#[test]
fn ramp_up_then_down() {
    let server = MockServer::start();
    common::mock_endpoints(&server);

    // 0 -> 8 users over 2s, hold 2s, back to 0 over 2s.
    let pattern = LoadPattern::Composite(vec![
        (
            LoadPattern::Ramp {
                start_users: 0,
                end_users: 8,
                ramp_duration: 2.0,
            },
            2.0,
        ),
        (LoadPattern::Constant { users: 8 }, 2.0),
        (
            LoadPattern::Ramp {
                start_users: 8,
                end_users: 0,
                ramp_duration: 2.0,
            },
            2.0,
        ),
    ]);

    let result = LoadTest::initialize_with_config(
        ScenarioDescriptor::new("Ramp", &server.base_url())
            .register_task(scenario_task!(index))
            .set_think_time(0.0, 0.0),
        pattern,
        common::build_configuration(),
    )
    .set_workers(2)
    .set_grace_period(1.0)
    .execute()
    .expect("load test failed");

    assert!(result.failure.is_none());
    // Composite pattern supplies its own duration; no --run-time needed.
    assert!(result.duration_seconds >= 6.0);

    // Targets follow the pattern through the scheduled snapshots.
    let targets: Vec<usize> = result
        .snapshots
        .iter()
        .take(7)
        .map(|snapshot| snapshot.target_users)
        .collect();
    assert_eq!(targets, vec![0, 4, 8, 8, 8, 4, 0]);

    // Observed users never exceed the current or previous target plus one per
    // worker (scale-down takes effect within the tick that requested it).
    let mut previous_target = 0;
    for snapshot in &result.snapshots {
        let bound = snapshot.target_users.max(previous_target) + 2;
        assert!(
            snapshot.active_users <= bound,
            "t={}s: {} active for target {}",
            snapshot.elapsed_seconds,
            snapshot.active_users,
            snapshot.target_users
        );
        previous_target = snapshot.target_users;
    }

    // During the hold phase the fleet reaches the full target.
    let held = result
        .snapshots
        .iter()
        .find(|snapshot| snapshot.elapsed_seconds == 4.0)
        .expect("missing hold-phase snapshot");
    assert_eq!(held.active_users, 8);

    // The scale history records the up and down phases and the finish.
    assert!(result
        .history
        .iter()
        .any(|event| event.action == ScaleAction::Increasing));
    assert!(result
        .history
        .iter()
        .any(|event| event.action == ScaleAction::Decreasing));
    assert_eq!(
        result.history.last().unwrap().action,
        ScaleAction::Finished
    );
}
