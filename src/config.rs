//! Functions and structures related to configuring a load test.
//!
//! LoadForge can be configured at run time by passing in the options and flags
//! defined by the [`ForgeConfiguration`] structure, or programmatically
//! through the [`LoadTest`](crate::LoadTest) builder methods.

use gumdrop::Options;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ForgeError;

/// Runtime options available when launching a load test.
///
/// LoadForge leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help
/// text from the structure below.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"LoadForge is an HTTP load-testing engine driving time-varying concurrency
against a target service, with per-second latency and error snapshots.

The following runtime options are available when launching a load test:"#
)]
pub struct ForgeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Overrides the load pattern (ie constant:10, ramp:0:100:60)
    #[options(short = "p", meta = "PATTERN")]
    pub pattern: Option<String>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Seconds between scheduler ticks and metric snapshots (default: 1)
    #[options(no_short, meta = "SECONDS")]
    pub tick_interval: Option<f64>,
    /// Sets worker count (default: number of CPUs)
    #[options(short = "w")]
    pub workers: Option<usize>,
    /// Aborts the test when fewer workers remain healthy (default: 1)
    #[options(no_short)]
    pub min_workers: Option<usize>,
    /// Caps total requests per second across all workers
    #[options(no_short, meta = "RPS")]
    pub rate_limit: Option<f64>,
    /// Sets the rate limiter burst size (default: one second of rate)
    #[options(no_short, meta = "TOKENS")]
    pub burst: Option<f64>,
    /// Per-request timeout in seconds (default: 30)
    #[options(no_short, meta = "SECONDS")]
    pub timeout: Option<f64>,
    /// Seconds granted to in-flight requests on shutdown (default: 5)
    #[options(no_short, meta = "SECONDS")]
    pub grace_period: Option<f64>,
    /// Rejects patterns targeting more concurrent users than this
    #[options(no_short, meta = "USERS")]
    pub max_users: Option<usize>,
    /// Doesn't print the summary tables at the end of the load test
    #[options(no_short)]
    pub no_print_summary: bool,

    /// Enables the log file and sets its name
    #[options(no_short, meta = "NAME")]
    pub log_file: String,
    /// Increases file log level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases console verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases console verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

impl ForgeConfiguration {
    /// The scheduler/aggregator tick cadence in seconds.
    pub fn resolved_tick_interval(&self) -> Result<f64, ForgeError> {
        let tick_interval = self.tick_interval.unwrap_or(1.0);
        if tick_interval > 0.0 {
            Ok(tick_interval)
        } else {
            Err(ForgeError::InvalidOption {
                option: "tick_interval".to_string(),
                value: tick_interval.to_string(),
                detail: "tick interval must be positive".to_string(),
            })
        }
    }

    /// How many worker threads to launch, defaulting to the CPU count and
    /// never exceeding what the pattern's peak concurrency can use.
    pub fn resolved_workers(&self, peak_users: usize) -> Result<usize, ForgeError> {
        let workers = match self.workers {
            Some(0) => {
                return Err(ForgeError::InvalidOption {
                    option: "workers".to_string(),
                    value: "0".to_string(),
                    detail: "at least 1 worker is required".to_string(),
                })
            }
            Some(workers) => workers,
            None => {
                let workers = num_cpus::get();
                info!("workers defaulted to {} (number of CPUs)", workers);
                workers
            }
        };
        // No point spawning more workers than there will ever be users, and
        // worker ids are a single byte on the wire.
        Ok(workers.min(peak_users.max(1)).min(u8::MAX as usize))
    }

    pub fn resolved_min_workers(&self, workers: usize) -> Result<usize, ForgeError> {
        let min_workers = self.min_workers.unwrap_or(1);
        if min_workers < 1 || min_workers > workers {
            return Err(ForgeError::InvalidOption {
                option: "min_workers".to_string(),
                value: min_workers.to_string(),
                detail: format!("must be between 1 and the worker count ({})", workers),
            });
        }
        Ok(min_workers)
    }

    /// The run duration in seconds: `--run-time` when set, otherwise the
    /// natural duration of a composite pattern.
    pub fn resolved_duration(&self, natural_duration: Option<f64>) -> Result<f64, ForgeError> {
        if !self.run_time.is_empty() {
            return parse_timespan(&self.run_time);
        }
        match natural_duration {
            Some(duration) => Ok(duration),
            None => Err(ForgeError::InvalidOption {
                option: "run_time".to_string(),
                value: String::new(),
                detail: "a run time is required unless the pattern is composite".to_string(),
            }),
        }
    }

    pub fn resolved_timeout(&self) -> Result<f64, ForgeError> {
        let timeout = self.timeout.unwrap_or(30.0);
        if timeout > 0.0 {
            Ok(timeout)
        } else {
            Err(ForgeError::InvalidOption {
                option: "timeout".to_string(),
                value: timeout.to_string(),
                detail: "request timeout must be positive".to_string(),
            })
        }
    }

    pub fn resolved_grace_period(&self) -> f64 {
        self.grace_period.unwrap_or(5.0).max(0.0)
    }

    pub fn resolved_max_users(&self) -> usize {
        self.max_users.unwrap_or(100_000)
    }
}

/// Parse a `--run-time` style span (`"90"`, `"90s"`, `"20m"`, `"1h30m"`,
/// `"2.5s"`) into seconds.
///
/// The whole string must form a valid span, components in `h`, `m`, `s`
/// order; malformed input is an error, never silently read as zero.
fn parse_timespan(input: &str) -> Result<f64, ForgeError> {
    let span = Regex::new(
        r"^(?:(?P<hours>\d+)h)?(?:(?P<minutes>\d+)m)?(?:(?P<seconds>\d+(?:\.\d+)?)s?)?$",
    )
    .expect("failed to compile timespan regex");
    let invalid = || ForgeError::InvalidOption {
        option: "run_time".to_string(),
        value: input.to_string(),
        detail: "expected a time span such as 90, 90s, 20m or 1h30m".to_string(),
    };

    let captures = span.captures(input.trim()).ok_or_else(|| invalid())?;
    let component = |name: &str| -> Result<f64, ForgeError> {
        match captures.name(name) {
            Some(digits) => digits.as_str().parse::<f64>().map_err(|_| invalid()),
            None => Ok(0.0),
        }
    };
    // All components are optional in the expression; at least one must match.
    if captures.name("hours").is_none()
        && captures.name("minutes").is_none()
        && captures.name("seconds").is_none()
    {
        return Err(invalid());
    }
    Ok(component("hours")? * 3_600.0 + component("minutes")? * 60.0 + component("seconds")?)
}
