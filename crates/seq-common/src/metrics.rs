//! Dispatch timing metrics.
//!
//! A fixed-size ring buffer of samples plus running statistics. Recording
//! never allocates, so the timer thread can record every tick.

use serde::Serialize;
use std::time::Duration;

/// Timing statistics for one measured quantity (dispatch duration or tick
/// wake-up latency) with a per-sample deadline.
///
/// Samples strictly greater than the deadline count as overruns.
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Ring buffer of samples in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples held (saturates at buffer size).
    sample_count: usize,
    /// Total samples recorded.
    total: u64,
    min_ns: u64,
    max_ns: u64,
    /// Sum of all samples for the mean.
    sum_ns: u64,
    /// Samples that exceeded the deadline.
    overrun_count: u64,
    /// Deadline in nanoseconds.
    deadline_ns: u64,
}

impl DispatchMetrics {
    /// Create a collector retaining `histogram_size` samples.
    ///
    /// # Arguments
    ///
    /// * `histogram_size` - Number of samples to retain in the ring buffer.
    /// * `deadline` - Samples exceeding this are counted as overruns.
    #[must_use]
    pub fn new(histogram_size: usize, deadline: Duration) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overrun_count: 0,
            deadline_ns: duration_ns(deadline),
        }
    }

    /// Record a sample. Returns true if it exceeded the deadline.
    #[inline]
    pub fn record(&mut self, sample: Duration) -> bool {
        self.record_ns(duration_ns(sample))
    }

    /// Record a sample given in nanoseconds. Returns true if it exceeded the
    /// deadline.
    pub fn record_ns(&mut self, ns: u64) -> bool {
        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = (self.sample_count + 1).min(self.samples.len());

        self.total += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);

        let overrun = ns > self.deadline_ns;
        if overrun {
            self.overrun_count += 1;
        }
        overrun
    }

    /// Total number of samples recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Configured deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_nanos(self.deadline_ns)
    }

    /// Minimum observed sample.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.min_ns))
    }

    /// Maximum observed sample.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Mean sample.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total > 0).then(|| Duration::from_nanos(self.sum_ns / self.total))
    }

    /// Number of samples over the deadline.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Compute a percentile (0.0 to 100.0) over the retained samples.
    ///
    /// Returns `None` without samples or for an out-of-range percentile.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        self.percentiles(&[percentile]).first().map(|&(_, d)| d)
    }

    /// Compute several percentiles with one sort.
    ///
    /// Invalid percentiles (< 0, > 100, or NaN) are skipped.
    #[must_use]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, Duration)> {
        if self.sample_count == 0 {
            return vec![];
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();
        let last = sorted.len() - 1;

        percentiles
            .iter()
            .filter(|p| (0.0..=100.0).contains(*p))
            .map(|&p| {
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let idx = ((p / 100.0) * last as f64).round() as usize;
                (p, Duration::from_nanos(sorted[idx.min(last)]))
            })
            .collect()
    }

    /// Get a snapshot of current statistics.
    #[must_use]
    pub fn snapshot(&self) -> TimingSnapshot {
        let any = self.total > 0;
        TimingSnapshot {
            total: self.total,
            min_ns: any.then_some(self.min_ns),
            max_ns: any.then_some(self.max_ns),
            mean_ns: any.then(|| self.sum_ns / self.total),
            p99_ns: self.percentile(99.0).map(duration_ns),
            overrun_count: self.overrun_count,
            deadline_ns: self.deadline_ns,
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Immutable copy of timing statistics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingSnapshot {
    /// Total samples recorded.
    pub total: u64,
    /// Minimum sample in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum sample in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean sample in nanoseconds.
    pub mean_ns: Option<u64>,
    /// 99th percentile of retained samples in nanoseconds.
    pub p99_ns: Option<u64>,
    /// Samples over the deadline.
    pub overrun_count: u64,
    /// Deadline in nanoseconds.
    pub deadline_ns: u64,
}

impl TimingSnapshot {
    /// Jitter (max - min) in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_ns, self.max_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}
