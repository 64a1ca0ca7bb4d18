//! Converts a load pattern's concurrency timeline into scale commands.
//!
//! The scheduler samples the pattern at the tick cadence and pushes one
//! [`ScaleCommand`] per tick to the coordinator. Sleeps target absolute
//! monotonic deadlines rather than accumulating intervals, so drift stays
//! bounded by a single tick.

use std::time::{Duration, Instant};

use crate::pattern::LoadPattern;

/// Direction of a concurrency scale step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
    Hold,
}

/// A command to adjust the number of active virtual users.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleCommand {
    /// Time offset from test start.
    pub elapsed: f64,
    /// Desired number of active virtual users across all workers.
    pub target: usize,
    pub direction: ScaleDirection,
    /// Absolute change in user count from the previous tick.
    pub delta: usize,
}

/// Emit one [`ScaleCommand`] per pattern tick until the schedule is exhausted
/// or the coordinator goes away.
pub(crate) async fn scheduler_loop(
    pattern: LoadPattern,
    duration: f64,
    tick_interval: f64,
    epoch: Instant,
    commands: flume::Sender<ScaleCommand>,
) {
    let mut previous_target = 0usize;
    for (elapsed, target) in pattern.ticks(duration, tick_interval) {
        let deadline = epoch + Duration::from_secs_f64(elapsed);
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;

        // A missed tick is reported but never compensated with a burst: the
        // next value is simply delivered late.
        let lateness = epoch.elapsed().as_secs_f64() - elapsed;
        if lateness > 2.0 * tick_interval {
            warn!(
                "scheduler tick at {:.1}s delivered {:.1}s late",
                elapsed, lateness
            );
        }

        let direction = match target.cmp(&previous_target) {
            std::cmp::Ordering::Greater => ScaleDirection::Up,
            std::cmp::Ordering::Less => ScaleDirection::Down,
            std::cmp::Ordering::Equal => ScaleDirection::Hold,
        };
        let delta = target.abs_diff(previous_target);
        previous_target = target;

        if commands
            .send_async(ScaleCommand {
                elapsed,
                target,
                direction,
                delta,
            })
            .await
            .is_err()
        {
            // Coordinator shut down mid-schedule.
            debug!("scale command channel closed, stopping scheduler");
            return;
        }
    }
    debug!("schedule complete after {:.1}s", duration);
}
