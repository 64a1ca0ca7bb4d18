//! # LoadForge
//!
//! LoadForge is an HTTP load-testing engine. It drives configurable,
//! time-varying concurrency against a target service, captures per-request
//! latency and error data, and produces per-second aggregated snapshots
//! suitable for live streaming and post-run reporting.
//!
//! A load test is built from two pieces: a [`ScenarioDescriptor`] describing
//! what each virtual user does, and a [`LoadPattern`] describing how many
//! virtual users should be active over time. The engine spawns a fleet of
//! single-threaded workers (one per CPU by default), multiplexes the virtual
//! users across them as cooperative tasks, and streams raw request metrics
//! through per-worker lock-free ring buffers to a 1 Hz aggregator that
//! computes HDR-histogram percentiles.
//!
//! ## Creating a load test
//!
//! Add LoadForge as a dependency in `Cargo.toml`, then define one or more
//! async task functions and register them on a scenario. Each task function
//! accepts the worker's instrumented HTTP client and performs one logical
//! operation:
//!
//! ```rust,no_run
//! use loadforge::prelude::*;
//!
//! async fn browse_index(session: &HttpSession) -> TaskResult {
//!     let _response = session.get("/", "index").await?;
//!     Ok(())
//! }
//!
//! async fn browse_about(session: &HttpSession) -> TaskResult {
//!     let _response = session.get("/about.html", "about").await?;
//!     Ok(())
//! }
//!
//! fn main() -> Result<(), ForgeError> {
//!     let scenario = ScenarioDescriptor::new("browse", "http://dev.local")
//!         // browse_index runs five times as often as browse_about.
//!         .register_task(scenario_task!(browse_index).set_weight(10))
//!         .register_task(scenario_task!(browse_about).set_weight(2))
//!         .set_think_time(0.5, 1.5);
//!
//!     let pattern = LoadPattern::Ramp {
//!         start_users: 0,
//!         end_users: 100,
//!         ramp_duration: 60.0,
//!     };
//!
//!     let result = LoadTest::initialize(scenario, pattern)
//!         .set_run_time("5m")
//!         .execute()?;
//!
//!     println!("total requests: {}", result.summary.total_requests);
//!     Ok(())
//! }
//! ```
//!
//! Every second the aggregator emits a [`MetricSnapshot`] with request rates,
//! latency percentiles, and error breakdowns, globally and per endpoint.
//! Snapshots can be streamed live through [`LoadTest::on_snapshot`]; the full
//! time series plus a cumulative summary comes back in the [`TestResult`].

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod metrics;
pub mod pattern;
pub mod prelude;
pub mod ring;
pub mod scenario;
pub mod throttle;

mod aggregator;
mod coordinator;
mod histogram;
mod scheduler;
mod user;
mod util;
mod worker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gumdrop::Options;
use simplelog::*;

pub use crate::aggregator::SnapshotCallback;
pub use crate::client::{HttpSession, RequestError};
pub use crate::config::ForgeConfiguration;
pub use crate::histogram::LatencyHistogram;
pub use crate::metrics::{MetricSnapshot, TestResult};
pub use crate::pattern::LoadPattern;
pub use crate::scenario::{ScenarioDescriptor, ScenarioTask, TaskResult};

/// An error encountered while configuring or running a load test.
#[derive(Debug)]
pub enum ForgeError {
    /// Wraps a [`std::io::Error`].
    Io(std::io::Error),
    /// Failure to parse or validate a configuration value.
    InvalidOption {
        /// The invalid option.
        option: String,
        /// The invalid value.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// The scenario descriptor cannot drive a load test.
    InvalidScenario { scenario: String, detail: String },
    /// A worker thread could not be spawned.
    WorkerSpawn { worker_id: u8, detail: String },
    /// The HTTP client could not be constructed.
    ClientBuild { detail: String },
}

impl ForgeError {
    fn describe(&self) -> &str {
        match self {
            ForgeError::Io(_) => "io::Error",
            ForgeError::InvalidOption { .. } => "invalid option or value specified",
            ForgeError::InvalidScenario { .. } => "invalid scenario descriptor",
            ForgeError::WorkerSpawn { .. } => "failed to spawn worker",
            ForgeError::ClientBuild { .. } => "failed to build HTTP client",
        }
    }
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForgeError::Io(e) => write!(f, "{}: {}", self.describe(), e),
            ForgeError::InvalidOption {
                option,
                value,
                detail,
            } => write!(
                f,
                "{}: option '{}' value '{}' ({})",
                self.describe(),
                option,
                value,
                detail
            ),
            ForgeError::InvalidScenario { scenario, detail } => {
                write!(f, "{}: {} ({})", self.describe(), scenario, detail)
            }
            ForgeError::WorkerSpawn { worker_id, detail } => {
                write!(f, "{}: worker {} ({})", self.describe(), worker_id, detail)
            }
            ForgeError::ClientBuild { detail } => {
                write!(f, "{}: {}", self.describe(), detail)
            }
        }
    }
}

impl std::error::Error for ForgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForgeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(e: std::io::Error) -> ForgeError {
        ForgeError::Io(e)
    }
}

/// A complete load test: scenario, pattern, and runtime configuration.
///
/// Built with [`LoadTest::initialize`] (parsing CLI options) or
/// [`LoadTest::initialize_with_config`], refined with the builder methods, and
/// run to completion with [`LoadTest::execute`].
pub struct LoadTest {
    scenario: ScenarioDescriptor,
    pattern: LoadPattern,
    configuration: ForgeConfiguration,
    on_snapshot: Option<SnapshotCallback>,
}

impl LoadTest {
    /// Load configuration from command line options and initialize a test.
    pub fn initialize(scenario: ScenarioDescriptor, pattern: LoadPattern) -> LoadTest {
        LoadTest {
            scenario,
            pattern,
            configuration: ForgeConfiguration::parse_args_default_or_exit(),
            on_snapshot: None,
        }
    }

    /// Initialize a load test with an already built configuration.
    pub fn initialize_with_config(
        scenario: ScenarioDescriptor,
        pattern: LoadPattern,
        configuration: ForgeConfiguration,
    ) -> LoadTest {
        LoadTest {
            scenario,
            pattern,
            configuration,
            on_snapshot: None,
        }
    }

    /// Stop the load test after a time span such as `"90s"` or `"1h30m"`.
    pub fn set_run_time(mut self, run_time: &str) -> Self {
        self.configuration.run_time = run_time.to_string();
        self
    }

    /// Override the number of worker threads (defaults to the CPU count).
    pub fn set_workers(mut self, workers: usize) -> Self {
        self.configuration.workers = Some(workers);
        self
    }

    /// Override the scheduler and snapshot tick interval in seconds.
    pub fn set_tick_interval(mut self, tick_interval: f64) -> Self {
        self.configuration.tick_interval = Some(tick_interval);
        self
    }

    /// Cap the total request rate across all workers, in requests per second.
    pub fn set_rate_limit(mut self, rate_limit: f64) -> Self {
        self.configuration.rate_limit = Some(rate_limit);
        self
    }

    /// Override the per-request HTTP timeout in seconds.
    pub fn set_request_timeout(mut self, timeout: f64) -> Self {
        self.configuration.timeout = Some(timeout);
        self
    }

    /// Override the shutdown grace period in seconds.
    pub fn set_grace_period(mut self, grace_period: f64) -> Self {
        self.configuration.grace_period = Some(grace_period);
        self
    }

    /// Reject patterns whose peak concurrency exceeds this limit.
    pub fn set_max_users(mut self, max_users: usize) -> Self {
        self.configuration.max_users = Some(max_users);
        self
    }

    /// Stream every [`MetricSnapshot`] to the given callback as it is
    /// produced, once per tick. The callback must not block longer than the
    /// tick interval.
    pub fn on_snapshot<F: FnMut(MetricSnapshot) + Send + 'static>(mut self, callback: F) -> Self {
        self.on_snapshot = Some(Box::new(callback));
        self
    }

    /// Execute the load test, blocking until it completes, and return the
    /// collected [`TestResult`].
    pub fn execute(mut self) -> Result<TestResult, ForgeError> {
        initialize_logger(&self.configuration);

        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // A pattern passed on the command line overrides the built-in one.
        if let Some(pattern) = &self.configuration.pattern {
            self.pattern = pattern.parse()?;
        }
        self.pattern.validate()?;
        self.scenario.validate()?;

        let tick_interval = self.configuration.resolved_tick_interval()?;
        let duration = self
            .configuration
            .resolved_duration(self.pattern.natural_duration())?;
        let peak_users = self.pattern.peak(duration, tick_interval);
        let max_users = self.configuration.resolved_max_users();
        if peak_users > max_users {
            return Err(ForgeError::InvalidOption {
                option: "max_users".to_string(),
                value: peak_users.to_string(),
                detail: format!(
                    "pattern peak concurrency {} exceeds the configured maximum {}",
                    peak_users, max_users
                ),
            });
        }
        let workers = self.configuration.resolved_workers(peak_users)?;
        let min_workers = self.configuration.resolved_min_workers(workers)?;
        let timeout = self.configuration.resolved_timeout()?;

        let description = self.pattern.describe();
        info!(
            "starting load test: scenario={}, workers={}, duration={:.1}s, pattern={}",
            self.scenario.name,
            workers,
            duration,
            description.lines().next().unwrap_or_default()
        );

        let settings = coordinator::CoordinatorSettings {
            scenario: Arc::new(self.scenario),
            pattern: self.pattern,
            duration,
            tick_interval,
            workers,
            min_workers,
            rate_limit: self.configuration.rate_limit.unwrap_or(0.0),
            burst: self.configuration.burst.unwrap_or(0.0),
            request_timeout: Duration::from_secs_f64(timeout),
            grace_period: Duration::from_secs_f64(self.configuration.resolved_grace_period()),
            on_snapshot: self.on_snapshot.take(),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let result = runtime.block_on(coordinator::run(settings))?;

        if !self.configuration.no_print_summary {
            println!("{}", result);
        }
        Ok(result)
    }
}

/// Initialize terminal and optional file logging from the configuration.
fn initialize_logger(configuration: &ForgeConfiguration) {
    // Console verbosity: Info by default, adjusted by -v and -q counts.
    let debug_level = match (configuration.verbose, configuration.quiet) {
        (0, 0) => LevelFilter::Info,
        (1, 0) => LevelFilter::Debug,
        (_, 0) => LevelFilter::Trace,
        (0, 1) => LevelFilter::Warn,
        (0, _) => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    // File log level from -g counts.
    let log_level = match configuration.log_level {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        debug_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if !configuration.log_file.is_empty() {
        match std::fs::File::create(&configuration.log_file) {
            Ok(file) => {
                loggers.push(WriteLogger::new(log_level, Config::default(), file));
            }
            Err(e) => {
                eprintln!(
                    "failed to create log file {}: {}",
                    configuration.log_file, e
                );
            }
        }
    }
    match CombinedLogger::init(loggers) {
        Ok(_) => {
            info!("output verbosity level: {}", debug_level);
            if !configuration.log_file.is_empty() {
                info!("writing to log file: {}", configuration.log_file);
            }
        }
        Err(e) => {
            // Tests run multiple loads in one process; the logger sticks.
            debug!("failed to initialize CombinedLogger: {}", e);
        }
    }
}
