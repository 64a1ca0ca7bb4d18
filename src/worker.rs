//! Worker threads hosting the virtual user fleet.
//!
//! Each worker runs a single-threaded cooperative scheduler: one OS thread
//! with a current-thread runtime multiplexing its share of virtual users plus
//! two utility tasks — the command listener draining the coordinator's channel
//! and a 250 ms heartbeat emitter. Workers never share memory with each other;
//! the only cross-thread surfaces are the command channel, the label channel,
//! and the worker's own ring buffer.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::client::{HttpSession, MetricSink};
use crate::metrics::EndpointLabel;
use crate::ring::RingProducer;
use crate::scenario::{ScenarioDescriptor, WeightedChoice};
use crate::throttle::Throttle;
use crate::user::{user_main, UserCommand};
use crate::util;
use crate::ForgeError;

/// Primitive commands crossing the coordinator→worker boundary.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WorkerCommand {
    /// Adjust the number of virtual users to the given share.
    Scale(usize),
    /// Stop accepting work and shut down within the grace period.
    Stop,
}

/// Plain data handed to a worker thread at spawn time.
#[derive(Clone)]
pub(crate) struct WorkerConfig {
    pub worker_id: u8,
    pub scenario: Arc<ScenarioDescriptor>,
    /// Shared start instant all timestamps and heartbeats are measured from.
    pub epoch: Instant,
    pub request_timeout: Duration,
    pub grace_period: Duration,
    /// Per-worker token bucket rate; 0 disables throttling.
    pub throttle_rate: f64,
    pub throttle_burst: f64,
    /// Shared counter of label registrations lost to a full channel.
    pub dropped_labels: Arc<AtomicU64>,
}

/// Spawn a worker on its own OS thread.
pub(crate) fn spawn_worker(
    config: WorkerConfig,
    producer: RingProducer,
    labels: flume::Sender<EndpointLabel>,
    commands: flume::Receiver<WorkerCommand>,
) -> Result<std::thread::JoinHandle<()>, ForgeError> {
    let worker_id = config.worker_id;
    std::thread::Builder::new()
        .name(format!("loadforge-worker-{}", worker_id))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    // The stale heartbeat surfaces this to the coordinator.
                    error!("worker {} failed to build runtime: {}", worker_id, e);
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, worker_main(config, producer, labels, commands));
        })
        .map_err(|e| ForgeError::WorkerSpawn {
            worker_id,
            detail: e.to_string(),
        })
}

async fn worker_main(
    config: WorkerConfig,
    producer: RingProducer,
    labels: flume::Sender<EndpointLabel>,
    commands: flume::Receiver<WorkerCommand>,
) {
    let worker_id = config.worker_id;
    let producer = Rc::new(producer);

    // Heartbeat emitter, the worker's liveness signal.
    let heartbeat_producer = producer.clone();
    let epoch = config.epoch;
    let heartbeat = tokio::task::spawn_local(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            interval.tick().await;
            heartbeat_producer.beat(util::monotonic_seconds(epoch));
        }
    });

    let chooser = match WeightedChoice::new(&config.scenario.tasks) {
        Ok(chooser) => Rc::new(chooser),
        Err(e) => {
            error!("worker {} has no runnable tasks: {}", worker_id, e);
            heartbeat.abort();
            return;
        }
    };
    let registered = Rc::new(RefCell::new(HashSet::new()));
    let throttle = if config.throttle_rate > 0.0 {
        info!(
            "worker {} throttled to {:.1} requests/second",
            worker_id, config.throttle_rate
        );
        Some(Rc::new(Throttle::new(
            config.throttle_rate,
            config.throttle_burst,
        )))
    } else {
        None
    };

    let mut users: Vec<(usize, tokio::task::JoinHandle<()>, flume::Sender<UserCommand>)> =
        Vec::new();
    // Retired users still finishing their teardown are joined at shutdown.
    let mut retired: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let mut next_user_number: usize = 1;

    // Command listener: the worker's main loop.
    while let Ok(command) = commands.recv_async().await {
        match command {
            WorkerCommand::Scale(target) => {
                // Clean up users that exited on their own first.
                users.retain(|(_, handle, _)| !handle.is_finished());

                if target > users.len() {
                    for _ in users.len()..target {
                        let sink = MetricSink::new(
                            producer.clone(),
                            labels.clone(),
                            registered.clone(),
                            config.dropped_labels.clone(),
                        );
                        let session = match HttpSession::new(
                            &config.scenario.base_url,
                            &config.scenario.default_headers,
                            worker_id,
                            epoch,
                            sink,
                            throttle.clone(),
                            config.request_timeout,
                        ) {
                            Ok(session) => Rc::new(session),
                            Err(e) => {
                                error!("worker {} failed to build session: {}", worker_id, e);
                                break;
                            }
                        };
                        let (sender, receiver) = flume::unbounded();
                        let handle = tokio::task::spawn_local(user_main(
                            next_user_number,
                            worker_id,
                            config.scenario.clone(),
                            chooser.clone(),
                            session,
                            receiver,
                        ));
                        users.push((next_user_number, handle, sender));
                        next_user_number += 1;
                    }
                } else {
                    // Scale down most-recently-created users first; each exits
                    // at its next safe point rather than mid-request.
                    while users.len() > target {
                        if let Some((user_number, handle, sender)) = users.pop() {
                            debug!("worker {} retiring user {}", worker_id, user_number);
                            let _ = sender.send(UserCommand::Exit);
                            retired.push(handle);
                        }
                    }
                    retired.retain(|handle| !handle.is_finished());
                }
                producer.set_active_users(users.len());
            }
            WorkerCommand::Stop => {
                debug!("worker {} received stop", worker_id);
                break;
            }
        }
    }

    // Graceful shutdown: no new task iterations, in-flight requests get up to
    // the grace period to complete, then cancellation.
    let mut handles = Vec::with_capacity(users.len() + retired.len());
    for (_, handle, sender) in users.drain(..) {
        let _ = sender.send(UserCommand::Exit);
        handles.push(handle);
    }
    handles.append(&mut retired);
    let abort_handles: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
    if tokio::time::timeout(config.grace_period, join_all(handles))
        .await
        .is_err()
    {
        warn!(
            "worker {} grace period expired, cancelling remaining users",
            worker_id
        );
        for abort_handle in abort_handles {
            abort_handle.abort();
        }
    }

    producer.set_active_users(0);
    heartbeat.abort();
    debug!("worker {} exited", worker_id);
}
