//! Traffic patterns controlling how target concurrency changes over time.
//!
//! Internally, LoadForge represents every load shape as a [`LoadPattern`]: a pure
//! function of elapsed time returning the number of virtual users that should be
//! active at that moment. The [`Scheduler`](../scheduler/index.html) samples the
//! pattern at the tick interval and forwards the targets to the coordinator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ForgeError;

/// A traffic pattern, sampled once per tick to produce the target concurrency.
///
/// Patterns are pure data: evaluating [`LoadPattern::target_at`] has no side
/// effects, and the tick sequence produced by [`LoadPattern::ticks`] can be
/// restarted at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoadPattern {
    /// A fixed number of concurrent users for the entire run.
    Constant { users: usize },
    /// Linear interpolation from `start_users` to `end_users` over
    /// `ramp_duration` seconds, holding `end_users` afterwards.
    Ramp {
        start_users: usize,
        end_users: usize,
        ramp_duration: f64,
    },
    /// Staircase increments: `step_size` users added every `step_duration`
    /// seconds, at most `steps` times.
    Step {
        start_users: usize,
        step_size: usize,
        step_duration: f64,
        steps: usize,
    },
    /// An instantaneous burst to `spike_users` for the first `spike_duration`
    /// seconds, then `base_users` for the remainder. No interpolation.
    Spike {
        base_users: usize,
        spike_users: usize,
        spike_duration: f64,
    },
    /// Day/night oscillation between `min_users` and `max_users` following a
    /// cosine curve with the given period in seconds, starting at the trough.
    Diurnal {
        min_users: usize,
        max_users: usize,
        period: f64,
    },
    /// Sequential concatenation of `(pattern, duration)` phases. Each phase is
    /// evaluated with its own local time; the final value is held after the
    /// last phase ends.
    Composite(Vec<(LoadPattern, f64)>),
}

impl LoadPattern {
    /// Confirm all pattern parameters are in range.
    pub fn validate(&self) -> Result<(), ForgeError> {
        match self {
            LoadPattern::Constant { .. } => Ok(()),
            LoadPattern::Ramp { ramp_duration, .. } => {
                validate_positive(*ramp_duration, "ramp_duration")
            }
            LoadPattern::Step {
                step_size,
                step_duration,
                steps,
                ..
            } => {
                if *step_size < 1 {
                    return Err(invalid("step_size", &step_size.to_string(), "must be >= 1"));
                }
                if *steps < 1 {
                    return Err(invalid("steps", &steps.to_string(), "must be >= 1"));
                }
                validate_positive(*step_duration, "step_duration")
            }
            LoadPattern::Spike { spike_duration, .. } => {
                validate_positive(*spike_duration, "spike_duration")
            }
            LoadPattern::Diurnal {
                min_users,
                max_users,
                period,
            } => {
                if max_users <= min_users {
                    return Err(invalid(
                        "max_users",
                        &max_users.to_string(),
                        "must be greater than min_users",
                    ));
                }
                validate_positive(*period, "period")
            }
            LoadPattern::Composite(phases) => {
                if phases.is_empty() {
                    return Err(invalid(
                        "phases",
                        "[]",
                        "must contain at least one (pattern, duration) entry",
                    ));
                }
                for (pattern, duration) in phases {
                    validate_positive(*duration, "phase duration")?;
                    pattern.validate()?;
                }
                Ok(())
            }
        }
    }

    /// The target concurrency at `elapsed` seconds from the start of the run.
    ///
    /// Always returns a value >= 0; times beyond the pattern's natural end
    /// hold the final value.
    pub fn target_at(&self, elapsed: f64) -> usize {
        match self {
            LoadPattern::Constant { users } => *users,
            LoadPattern::Ramp {
                start_users,
                end_users,
                ramp_duration,
            } => {
                let fraction = (elapsed / ramp_duration).clamp(0.0, 1.0);
                let users = *start_users as f64
                    + (*end_users as f64 - *start_users as f64) * fraction;
                users.round().max(0.0) as usize
            }
            LoadPattern::Step {
                start_users,
                step_size,
                step_duration,
                steps,
            } => {
                let completed = ((elapsed / step_duration).floor() as usize).min(*steps);
                start_users + step_size * completed
            }
            LoadPattern::Spike {
                base_users,
                spike_users,
                spike_duration,
            } => {
                if elapsed < *spike_duration {
                    *spike_users
                } else {
                    *base_users
                }
            }
            LoadPattern::Diurnal {
                min_users,
                max_users,
                period,
            } => {
                let amplitude = (*max_users - *min_users) as f64;
                let phase = 2.0 * std::f64::consts::PI * elapsed / period;
                let users = *min_users as f64 + amplitude * (1.0 - phase.cos()) / 2.0;
                users.round().max(0.0) as usize
            }
            LoadPattern::Composite(phases) => {
                let mut offset = 0.0;
                for (pattern, duration) in phases {
                    // The boundary tick belongs to the next phase.
                    if elapsed < offset + duration {
                        return pattern.target_at(elapsed - offset);
                    }
                    offset += duration;
                }
                match phases.last() {
                    Some((pattern, duration)) => pattern.target_at(*duration),
                    None => 0,
                }
            }
        }
    }

    /// Total duration of a composite pattern, or `None` for open-ended shapes.
    pub fn natural_duration(&self) -> Option<f64> {
        match self {
            LoadPattern::Composite(phases) => Some(phases.iter().map(|(_, d)| d).sum()),
            _ => None,
        }
    }

    /// The number of ticks a schedule of `duration` seconds produces,
    /// including both endpoints.
    pub fn tick_count(duration: f64, tick_interval: f64) -> usize {
        (duration / tick_interval).ceil() as usize + 1
    }

    /// A restartable sequence of `(elapsed_seconds, target_concurrency)`
    /// pairs at `{0, tick, 2·tick, …, duration}`.
    pub fn ticks(&self, duration: f64, tick_interval: f64) -> PatternTicks<'_> {
        PatternTicks {
            pattern: self,
            duration,
            tick_interval,
            index: 0,
            count: Self::tick_count(duration, tick_interval),
        }
    }

    /// The largest concurrency value the pattern reaches over `duration`.
    pub fn peak(&self, duration: f64, tick_interval: f64) -> usize {
        self.ticks(duration, tick_interval)
            .map(|(_, users)| users)
            .max()
            .unwrap_or(0)
    }

    /// A stable, human-readable description for logs and report headers.
    pub fn describe(&self) -> String {
        match self {
            LoadPattern::Constant { users } => format!("Constant: {} users", users),
            LoadPattern::Ramp {
                start_users,
                end_users,
                ramp_duration,
            } => format!(
                "Ramp: {} -> {} users over {}s",
                start_users, end_users, ramp_duration
            ),
            LoadPattern::Step {
                start_users,
                step_size,
                step_duration,
                steps,
            } => format!(
                "Step: {} -> {} users (+{} every {}s, {} steps)",
                start_users,
                start_users + step_size * steps,
                step_size,
                step_duration,
                steps
            ),
            LoadPattern::Spike {
                base_users,
                spike_users,
                spike_duration,
            } => format!(
                "Spike: {} -> {} users for {}s",
                base_users, spike_users, spike_duration
            ),
            LoadPattern::Diurnal {
                min_users,
                max_users,
                period,
            } => format!(
                "Diurnal: {} - {} users, period {}s",
                min_users, max_users, period
            ),
            LoadPattern::Composite(phases) => {
                let total: f64 = phases.iter().map(|(_, d)| d).sum();
                let mut lines = vec![format!(
                    "Composite: {} phases, {}s total",
                    phases.len(),
                    total
                )];
                for (i, (pattern, duration)) in phases.iter().enumerate() {
                    lines.push(format!("  {}. {} ({}s)", i + 1, pattern.describe(), duration));
                }
                lines.join("\n")
            }
        }
    }
}

impl fmt::Display for LoadPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Iterator over a pattern's tick sequence. See [`LoadPattern::ticks`].
pub struct PatternTicks<'a> {
    pattern: &'a LoadPattern,
    duration: f64,
    tick_interval: f64,
    index: usize,
    count: usize,
}

impl Iterator for PatternTicks<'_> {
    type Item = (f64, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        // The final tick always lands exactly on the configured duration.
        let elapsed = if self.index + 1 == self.count {
            self.duration
        } else {
            self.index as f64 * self.tick_interval
        };
        self.index += 1;
        Some((elapsed, self.pattern.target_at(elapsed)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.index;
        (remaining, Some(remaining))
    }
}

/// Convert `"kind:arg:arg"` string formatted patterns to a [`LoadPattern`].
///
/// Supported forms:
///  - `constant:USERS`
///  - `ramp:START:END:SECONDS`
///  - `step:START:SIZE:SECONDS:STEPS`
///  - `spike:BASE:PEAK:SECONDS`
///  - `diurnal:MIN:MAX:PERIOD`
///
/// Multiple segments joined with `;`, each suffixed `@SECONDS`, build a
/// composite pattern: `"ramp:0:20:2@2;constant:20@3"`.
impl FromStr for LoadPattern {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split(';').map(str::trim).collect();
        if segments.len() > 1 || s.contains('@') {
            let mut phases = Vec::with_capacity(segments.len());
            for segment in segments {
                let (spec, duration) = match segment.split_once('@') {
                    Some((spec, duration)) => (
                        spec,
                        duration.parse::<f64>().map_err(|_| {
                            invalid("pattern", segment, "phase duration must be a number")
                        })?,
                    ),
                    None => {
                        return Err(invalid(
                            "pattern",
                            segment,
                            "composite phases require an @SECONDS suffix",
                        ))
                    }
                };
                phases.push((parse_simple_pattern(spec)?, duration));
            }
            let pattern = LoadPattern::Composite(phases);
            pattern.validate()?;
            Ok(pattern)
        } else {
            let pattern = parse_simple_pattern(s)?;
            pattern.validate()?;
            Ok(pattern)
        }
    }
}

fn parse_simple_pattern(s: &str) -> Result<LoadPattern, ForgeError> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let numbers = |expected: usize| -> Result<Vec<f64>, ForgeError> {
        if parts.len() != expected + 1 {
            return Err(invalid(
                "pattern",
                s,
                &format!("expected {} arguments for {}", expected, parts[0]),
            ));
        }
        parts[1..]
            .iter()
            .map(|p| {
                p.parse::<f64>()
                    .map_err(|_| invalid("pattern", s, "arguments must be numbers"))
            })
            .collect()
    };
    match parts[0] {
        "constant" => {
            let args = numbers(1)?;
            Ok(LoadPattern::Constant {
                users: args[0] as usize,
            })
        }
        "ramp" => {
            let args = numbers(3)?;
            Ok(LoadPattern::Ramp {
                start_users: args[0] as usize,
                end_users: args[1] as usize,
                ramp_duration: args[2],
            })
        }
        "step" => {
            let args = numbers(4)?;
            Ok(LoadPattern::Step {
                start_users: args[0] as usize,
                step_size: args[1] as usize,
                step_duration: args[2],
                steps: args[3] as usize,
            })
        }
        "spike" => {
            let args = numbers(3)?;
            Ok(LoadPattern::Spike {
                base_users: args[0] as usize,
                spike_users: args[1] as usize,
                spike_duration: args[2],
            })
        }
        "diurnal" => {
            let args = numbers(3)?;
            Ok(LoadPattern::Diurnal {
                min_users: args[0] as usize,
                max_users: args[1] as usize,
                period: args[2],
            })
        }
        other => Err(invalid(
            "pattern",
            other,
            "expected constant, ramp, step, spike or diurnal",
        )),
    }
}

fn validate_positive(value: f64, name: &str) -> Result<(), ForgeError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, &value.to_string(), "must be positive"))
    }
}

fn invalid(option: &str, value: &str, detail: &str) -> ForgeError {
    ForgeError::InvalidOption {
        option: option.to_string(),
        value: value.to_string(),
        detail: detail.to_string(),
    }
}
