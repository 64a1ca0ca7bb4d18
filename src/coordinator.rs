//! The coordinator: spawns the worker fleet, splits concurrency across it, and
//! owns the [`TestResult`].
//!
//! The coordinator's control task receives scale commands from the scheduler,
//! distributes integer shares to workers, watches worker heartbeats, and
//! orchestrates shutdown. The scheduler and aggregator run as background
//! cooperative tasks on the coordinator's runtime; workers run on their own
//! threads and are reached only through typed channels.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::prelude::*;

use crate::aggregator::{aggregator_loop, AggregatorConfig, SnapshotCallback};
use crate::metrics::{
    EndpointLabel, MetricSnapshot, ScaleAction, ScaleEvent, TestResult, WorkerEvent,
    WorkerEventKind,
};
use crate::pattern::LoadPattern;
use crate::ring::{ring_channel, RingMonitor};
use crate::scenario::ScenarioDescriptor;
use crate::scheduler::{scheduler_loop, ScaleDirection};
use crate::util;
use crate::worker::{spawn_worker, WorkerCommand, WorkerConfig};
use crate::ForgeError;

/// Capacity of the endpoint label channel. Labels are rare; overflow drops
/// the registration and the aggregator falls back to showing the hash.
const LABEL_CHANNEL_SIZE: usize = 4_096;

/// Seconds without a heartbeat before a worker is declared failed.
const HEARTBEAT_TIMEOUT: f64 = 5.0;

/// Restarts permitted per worker id per run.
const MAX_WORKER_RESTARTS: u8 = 1;

/// Fully-resolved settings for one load test run.
pub(crate) struct CoordinatorSettings {
    pub scenario: Arc<ScenarioDescriptor>,
    pub pattern: LoadPattern,
    pub duration: f64,
    pub tick_interval: f64,
    pub workers: usize,
    pub min_workers: usize,
    /// Global requests-per-second cap, divided across workers. 0 disables.
    pub rate_limit: f64,
    pub burst: f64,
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub on_snapshot: Option<SnapshotCallback>,
}

struct WorkerHandle {
    worker_id: u8,
    thread: Option<std::thread::JoinHandle<()>>,
    commands: flume::Sender<WorkerCommand>,
    monitor: RingMonitor,
    healthy: bool,
    restarts: u8,
}

/// Execute the load test to completion and return the result.
pub(crate) async fn run(mut settings: CoordinatorSettings) -> Result<TestResult, ForgeError> {
    let started_wall = Utc::now();
    let epoch = Instant::now();

    let (label_sender, label_receiver) = flume::bounded(LABEL_CHANNEL_SIZE);
    let (consumer_sender, consumer_receiver) = flume::unbounded();
    let (stop_sender, stop_receiver) = flume::bounded(1);
    let (scale_sender, scale_receiver) = flume::unbounded();

    let target_gauge = Arc::new(AtomicUsize::new(0));
    let dropped_labels = Arc::new(AtomicU64::new(0));

    // The per-worker configuration template; only the id varies.
    let per_worker_rate = if settings.rate_limit > 0.0 {
        settings.rate_limit / settings.workers as f64
    } else {
        0.0
    };
    let per_worker_burst = if settings.burst > 0.0 {
        settings.burst / settings.workers as f64
    } else {
        0.0
    };
    let worker_template = WorkerConfig {
        worker_id: 0,
        scenario: settings.scenario.clone(),
        epoch,
        request_timeout: settings.request_timeout,
        grace_period: settings.grace_period,
        throttle_rate: per_worker_rate,
        throttle_burst: per_worker_burst,
        dropped_labels: dropped_labels.clone(),
    };

    // Spawn the worker fleet.
    let mut workers: Vec<WorkerHandle> = Vec::with_capacity(settings.workers);
    let mut consumers = Vec::with_capacity(settings.workers);
    for worker_id in 0..settings.workers as u8 {
        let (producer, consumer, monitor) = ring_channel(worker_id, 0.0);
        let (command_sender, command_receiver) = flume::unbounded();
        let config = WorkerConfig {
            worker_id,
            ..worker_template.clone()
        };
        let thread = spawn_worker(config, producer, label_sender.clone(), command_receiver)?;
        consumers.push(consumer);
        workers.push(WorkerHandle {
            worker_id,
            thread: Some(thread),
            commands: command_sender,
            monitor,
            healthy: true,
            restarts: 0,
        });
    }
    info!("spawned {} workers", workers.len());

    let aggregator = tokio::spawn(aggregator_loop(
        AggregatorConfig {
            tick_interval: settings.tick_interval,
            epoch,
            target_users: target_gauge.clone(),
            dropped_labels,
        },
        consumers,
        consumer_receiver,
        label_receiver,
        stop_receiver,
        settings.on_snapshot.take(),
    ));

    let scheduler = tokio::spawn(scheduler_loop(
        settings.pattern.clone(),
        settings.duration,
        settings.tick_interval,
        epoch,
        scale_sender,
    ));

    // First SIGINT/SIGTERM requests a clean shutdown; a second forces exit.
    let canceled = install_shutdown_handler();

    let mut history: Vec<ScaleEvent> = Vec::new();
    let mut worker_events: Vec<WorkerEvent> = Vec::new();
    let mut failure: Option<String> = None;
    let mut current_target = 0usize;

    'control: loop {
        tokio::select! {
            command = scale_receiver.recv_async() => {
                let command = match command {
                    Ok(command) => command,
                    // Scheduler finished its timeline: the test is over.
                    Err(_) => break 'control,
                };
                current_target = command.target;
                target_gauge.store(command.target, Ordering::Relaxed);
                if command.direction != ScaleDirection::Hold {
                    let action = match command.direction {
                        ScaleDirection::Up => ScaleAction::Increasing,
                        ScaleDirection::Down => ScaleAction::Decreasing,
                        ScaleDirection::Hold => ScaleAction::Maintaining,
                    };
                    debug!(
                        "tick {:.1}s: target {} ({} {})",
                        command.elapsed,
                        command.target,
                        if command.direction == ScaleDirection::Up { "+" } else { "-" },
                        command.delta
                    );
                    history.push(ScaleEvent::step(action, command.target));
                }

                if let Some(reason) = check_worker_health(
                    &mut workers,
                    epoch,
                    settings.min_workers,
                    &worker_template,
                    &label_sender,
                    &consumer_sender,
                    &mut worker_events,
                ) {
                    failure = Some(reason);
                    break 'control;
                }

                distribute(&workers, current_target);
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if canceled.load(Ordering::SeqCst) {
                    info!(
                        "stopping after {:.1} seconds (shutdown requested)...",
                        epoch.elapsed().as_secs_f64()
                    );
                    break 'control;
                }
            }
        }
    }
    history.push(ScaleEvent::step(ScaleAction::Finished, current_target));
    scheduler.abort();

    // Broadcast stop, then give every worker its grace period to finish
    // in-flight requests before the threads wind down.
    info!("waiting for workers to exit...");
    for worker in &workers {
        let _ = worker.commands.send(WorkerCommand::Stop);
    }
    let threads: Vec<std::thread::JoinHandle<()>> = workers
        .iter_mut()
        .filter_map(|worker| worker.thread.take())
        .collect();
    let joined = tokio::task::spawn_blocking(move || {
        for thread in threads {
            if thread.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    });
    let _ = joined.await;

    // The aggregator always performs a final drain and emits the cumulative
    // summary before shutdown returns.
    let _ = stop_sender.send(());
    let (snapshots, summary) = match aggregator.await {
        Ok(output) => (output.snapshots, output.summary),
        Err(e) => {
            error!("aggregator task failed: {}", e);
            failure.get_or_insert_with(|| format!("aggregator task failed: {}", e));
            (
                Vec::new(),
                MetricSnapshot::empty(Utc::now(), epoch.elapsed().as_secs_f64(), 0, 0),
            )
        }
    };

    let ended_wall = Utc::now();
    if let Some(reason) = &failure {
        warn!("load test aborted: {}", reason);
    }
    Ok(TestResult {
        scenario_name: settings.scenario.name.clone(),
        pattern: settings.pattern.describe(),
        started: started_wall,
        ended: ended_wall,
        duration_seconds: epoch.elapsed().as_secs_f64(),
        snapshots,
        summary,
        history,
        worker_events,
        failure,
    })
}

/// Install the SIGINT/SIGTERM handler and return the shutdown flag it flips.
///
/// The first signal requests a clean shutdown; a second one aborts the
/// process without waiting for the grace period.
fn install_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let flag = shutdown_requested.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            warn!("second shutdown signal, terminating immediately");
            std::process::exit(1);
        }
        warn!("shutdown signal received, finishing in-flight work...");
    }) {
        // Repeated runs in one process can only install the handler once.
        info!("shutdown handler not installed: {}", e);
    }
    shutdown_requested
}

/// Split the target across healthy workers: integer division with the
/// remainder assigned to earlier-indexed workers, rebroadcast every tick.
fn distribute(workers: &[WorkerHandle], target: usize) {
    let healthy_count = workers.iter().filter(|worker| worker.healthy).count();
    if healthy_count == 0 {
        return;
    }
    let base = target / healthy_count;
    let remainder = target % healthy_count;
    let mut index = 0;
    for worker in workers.iter().filter(|worker| worker.healthy) {
        let share = base + usize::from(index < remainder);
        if worker.commands.send(WorkerCommand::Scale(share)).is_err() {
            // Health checking picks the dead worker up on the next tick.
            debug!("worker {} command channel closed", worker.worker_id);
        }
        index += 1;
    }
}

/// Declare workers with stale heartbeats failed, restart each at most once,
/// and abort the run when the fleet shrinks below the minimum.
fn check_worker_health(
    workers: &mut [WorkerHandle],
    epoch: Instant,
    min_workers: usize,
    template: &WorkerConfig,
    label_sender: &flume::Sender<EndpointLabel>,
    consumer_sender: &flume::Sender<crate::ring::RingConsumer>,
    worker_events: &mut Vec<WorkerEvent>,
) -> Option<String> {
    let now = util::monotonic_seconds(epoch);
    for worker in workers.iter_mut() {
        if !worker.healthy {
            continue;
        }
        let thread_exited = worker
            .thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true);
        let heartbeat_age = now - worker.monitor.heartbeat();
        if !thread_exited && heartbeat_age <= HEARTBEAT_TIMEOUT {
            continue;
        }

        warn!(
            "worker {} failed (heartbeat {:.1}s old, thread exited: {})",
            worker.worker_id, heartbeat_age, thread_exited
        );
        worker.healthy = false;
        worker_events.push(WorkerEvent {
            worker_id: worker.worker_id,
            timestamp: Utc::now(),
            kind: WorkerEventKind::Failed,
        });

        if worker.restarts < MAX_WORKER_RESTARTS {
            let (producer, consumer, monitor) =
                ring_channel(worker.worker_id, util::monotonic_seconds(epoch));
            let (command_sender, command_receiver) = flume::unbounded();
            let config = WorkerConfig {
                worker_id: worker.worker_id,
                ..template.clone()
            };
            match spawn_worker(config, producer, label_sender.clone(), command_receiver) {
                Ok(thread) => {
                    info!("restarted worker {}", worker.worker_id);
                    let _ = consumer_sender.send(consumer);
                    // The old thread, if merely hung, is left to wind down on
                    // its own; its ring is no longer drained.
                    worker.thread = Some(thread);
                    worker.commands = command_sender;
                    worker.monitor = monitor;
                    worker.healthy = true;
                    worker.restarts += 1;
                    worker_events.push(WorkerEvent {
                        worker_id: worker.worker_id,
                        timestamp: Utc::now(),
                        kind: WorkerEventKind::Restarted,
                    });
                }
                Err(e) => {
                    error!("failed to restart worker {}: {}", worker.worker_id, e);
                }
            }
        } else {
            info!(
                "worker {} exceeded the restart policy, excluding from distribution",
                worker.worker_id
            );
        }
    }

    let healthy_count = workers.iter().filter(|worker| worker.healthy).count();
    if healthy_count < min_workers {
        Some(format!(
            "only {} healthy workers remain (minimum {})",
            healthy_count, min_workers
        ))
    } else {
        None
    }
}
