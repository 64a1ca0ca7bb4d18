//! HDR histogram wrapper for latency percentile computation.
//!
//! All public methods accept and return values in milliseconds; internally
//! values are stored as integer microseconds, trackable from 1 microsecond to
//! 60 seconds with 3 significant digits.

use hdrhistogram::Histogram;

/// Lowest trackable latency, in microseconds.
const LOWEST_TRACKABLE_US: u64 = 1;
/// Highest trackable latency, in microseconds (60 seconds).
const HIGHEST_TRACKABLE_US: u64 = 60_000_000;
/// Number of significant value digits maintained by the histogram.
const SIGNIFICANT_DIGITS: u8 = 3;

/// A latency histogram with O(1) record and logarithmic-bucket percentiles.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> LatencyHistogram {
        LatencyHistogram {
            histogram: Histogram::new_with_bounds(
                LOWEST_TRACKABLE_US,
                HIGHEST_TRACKABLE_US,
                SIGNIFICANT_DIGITS,
            )
            .expect("failed to allocate latency histogram"),
        }
    }

    /// Record a latency in milliseconds, clamped to the trackable range.
    pub fn record(&mut self, latency_ms: f64) {
        let value_us = ((latency_ms * 1_000.0) as u64)
            .clamp(LOWEST_TRACKABLE_US, HIGHEST_TRACKABLE_US);
        let _ = self.histogram.record(value_us);
    }

    /// The latency in milliseconds at the given percentile (0.0 to 100.0).
    ///
    /// Ties break toward the lower equivalent bucket value. Returns NaN when
    /// the histogram is empty.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        let quantile = (percentile / 100.0).clamp(0.0, 1.0);
        let value_us = self.histogram.value_at_quantile(quantile);
        self.histogram.lowest_equivalent(value_us) as f64 / 1_000.0
    }

    /// Minimum recorded latency in milliseconds, or NaN when empty.
    pub fn min(&self) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.histogram.min() as f64 / 1_000.0
    }

    /// Maximum recorded latency in milliseconds, or NaN when empty.
    pub fn max(&self) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.histogram.max() as f64 / 1_000.0
    }

    /// Mean recorded latency in milliseconds, or NaN when empty.
    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.histogram.mean() / 1_000.0
    }

    /// Number of values recorded.
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Discard all recorded values.
    pub fn reset(&mut self) {
        self.histogram.reset();
    }

    /// Merge all values recorded in `other` into this histogram.
    pub fn merge(&mut self, other: &LatencyHistogram) {
        if self.histogram.add(&other.histogram).is_err() {
            // Identical bounds make this unreachable; don't lose the tick over it.
            warn!("failed to merge latency histograms");
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        LatencyHistogram::new()
    }
}
