//! Online throughput and time-remaining estimation for the churn loop.
//!
//! The estimator calibrates once at [`ETA_SAMPLE`] iterations and refreshes
//! at every multiple of [`ETA_EVERY`] after that. Every estimate is computed
//! from cumulative counters (iterations completed and monotonic time since
//! the loop started), so later estimates average over more of the run
//! instead of reacting to a single window.

use std::time::Duration;

use serde::Serialize;

use crate::context::RunContext;
use crate::periodic::{PeriodicTask, Tick};
use crate::platform::Platform;

/// Iteration at which the first estimate is taken.
pub const ETA_SAMPLE: u64 = 200;

/// Refresh cadence after calibration.
pub const ETA_EVERY: u64 = 500;

/// Cumulative progress at one point of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThroughputSample {
    pub iteration_index: u64,
    pub elapsed_nanos: u64,
}

impl ThroughputSample {
    #[must_use]
    pub fn new(iteration_index: u64, elapsed: Duration) -> Self {
        Self {
            iteration_index,
            elapsed_nanos: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Iterations per second; zero when no time has been measured.
    #[must_use]
    pub fn iterations_per_second(&self) -> f64 {
        if self.elapsed_nanos == 0 {
            return 0.0;
        }
        self.iteration_index as f64 / (self.elapsed_nanos as f64 / 1e9)
    }
}

/// What an estimator observation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EtaReport {
    Estimate {
        iteration: u64,
        iterations_per_second: f64,
        remaining_secs: u64,
    },
    /// Throughput rounded to zero; no estimate is published.
    Unmeasurable { iteration: u64 },
}

impl EtaReport {
    /// Operator-facing log line.
    #[must_use]
    pub fn describe(&self, total: u64) -> String {
        match *self {
            Self::Estimate {
                iteration,
                iterations_per_second,
                remaining_secs,
            } => format!(
                "eta at {iteration}/{total}: {iterations_per_second:.1} it/s, about {} remaining",
                format_duration(Duration::from_secs(remaining_secs))
            ),
            Self::Unmeasurable { iteration } => format!(
                "eta at {iteration}/{total}: unable to compute (throughput rounds to 0 it/s)"
            ),
        }
    }
}

/// Calibrating time-remaining estimator.
#[derive(Debug, Clone)]
pub struct Estimator {
    total: u64,
    calibration: Option<ThroughputSample>,
    latest: Option<ThroughputSample>,
}

impl Estimator {
    #[must_use]
    pub const fn new(total: u64) -> Self {
        Self {
            total,
            calibration: None,
            latest: None,
        }
    }

    /// Whether `iteration` is the calibration point or a refresh point.
    #[must_use]
    pub const fn is_due_at(iteration: u64) -> bool {
        iteration == ETA_SAMPLE || (iteration > ETA_SAMPLE && iteration % ETA_EVERY == 0)
    }

    #[must_use]
    pub const fn calibration(&self) -> Option<ThroughputSample> {
        self.calibration
    }

    #[must_use]
    pub const fn latest(&self) -> Option<ThroughputSample> {
        self.latest
    }

    /// Record cumulative progress and derive an estimate.
    ///
    /// `elapsed` is monotonic time since the loop started, not since the
    /// previous observation.
    pub fn observe(&mut self, iteration: u64, elapsed: Duration) -> EtaReport {
        let sample = ThroughputSample::new(iteration, elapsed);
        if self.calibration.is_none() {
            self.calibration = Some(sample);
        }
        self.latest = Some(sample);

        let rate = sample.iterations_per_second();
        if !rate.is_finite() || rate.round() == 0.0 {
            return EtaReport::Unmeasurable { iteration };
        }
        let remaining_iterations = self.total.saturating_sub(iteration);
        let remaining_secs = (remaining_iterations as f64 / rate).round() as u64;
        EtaReport::Estimate {
            iteration,
            iterations_per_second: rate,
            remaining_secs,
        }
    }
}

impl PeriodicTask for Estimator {
    fn name(&self) -> &'static str {
        "eta"
    }

    fn is_due(&self, iteration: u64) -> bool {
        Self::is_due_at(iteration)
    }

    fn on_tick(&mut self, tick: &Tick, ctx: &mut RunContext, _platform: &dyn Platform) {
        let report = self.observe(tick.iteration, tick.elapsed);
        ctx.info(report.describe(tick.total));
    }
}

/// `1h 02m 03s`, `4m 05s` or `9s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
