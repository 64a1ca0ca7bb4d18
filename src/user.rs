//! The virtual user loop: one cooperative task per simulated client.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::client::HttpSession;
use crate::scenario::{ScenarioDescriptor, WeightedChoice};

/// Commands sent from the worker to its virtual user tasks.
#[derive(Debug, Clone, Copy)]
pub(crate) enum UserCommand {
    Exit,
}

/// Run one virtual user until told to exit: setup once, then repeatedly pick a
/// weighted task, invoke it, and pause for the scenario's think time. Teardown
/// runs on the way out and its failure never aborts shutdown.
pub(crate) async fn user_main(
    user_number: usize,
    worker_id: u8,
    scenario: Arc<ScenarioDescriptor>,
    chooser: Rc<WeightedChoice>,
    session: Rc<HttpSession>,
    receiver: flume::Receiver<UserCommand>,
) {
    debug!(
        "[worker {}] launching user {} from {}...",
        worker_id, user_number, scenario.name
    );

    if let Some(setup) = &scenario.setup {
        if let Err(e) = setup(&session).await {
            warn!(
                "[worker {}] user {} setup failed: {}",
                worker_id, user_number, e
            );
        }
    }

    'run_tasks: loop {
        if received_exit(&receiver) {
            break 'run_tasks;
        }

        // Weighted random selection over the scenario's tasks.
        let task_index = chooser.pick(&mut rand::thread_rng());
        let task = &scenario.tasks[task_index];
        debug!(
            "[user {}]: launching {} task from {}",
            user_number, task.name, scenario.name
        );
        if let Err(e) = (task.function)(&session).await {
            // Request-level failures are already recorded in the metrics; the
            // scenario author sees the response and decides about retries.
            debug!("task {} failed for user {}: {}", task.name, user_number, e);
        }

        if received_exit(&receiver) {
            break 'run_tasks;
        }

        // Sleep for a random think time, waking regularly so a sleeping user
        // still shuts down quickly when the load test ends.
        let (think_min, think_max) = scenario.think_time;
        let mut wait_time_ms = if think_max > think_min {
            (rand::thread_rng().gen_range(think_min..think_max) * 1_000.0) as u64
        } else {
            (think_min * 1_000.0) as u64
        };
        let maximum_sleep_time_ms = 500;
        while wait_time_ms > 0 {
            if received_exit(&receiver) {
                break 'run_tasks;
            }
            let sleep_duration_ms = wait_time_ms.min(maximum_sleep_time_ms);
            wait_time_ms -= sleep_duration_ms;
            tokio::time::sleep(Duration::from_millis(sleep_duration_ms)).await;
        }
    }

    if let Some(teardown) = &scenario.teardown {
        if let Err(e) = teardown(&session).await {
            warn!(
                "[worker {}] user {} teardown failed: {}",
                worker_id, user_number, e
            );
        }
    }

    debug!(
        "[worker {}] exiting user {} from {}...",
        worker_id, user_number, scenario.name
    );
}

// Determine if the worker has sent a UserCommand::Exit message.
fn received_exit(receiver: &flume::Receiver<UserCommand>) -> bool {
    matches!(receiver.try_recv(), Ok(UserCommand::Exit))
}
