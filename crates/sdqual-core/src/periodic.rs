//! Iteration-keyed periodic behaviours for long-running loops.
//!
//! A loop calls [`IterationDriver::dispatch`] once per completed iteration.
//! The driver asks each registered [`PeriodicTask`] whether it is due and
//! runs the ones that are, in registration order. Tasks are independent:
//! adding or retuning one never touches the loop body or the other tasks.
//!
//! ```text
//!  churn loop ── iteration i done ──▶ IterationDriver::dispatch(tick)
//!                                        ├── ProgressReporter  (i % 250 == 0)
//!                                        ├── FaultSpotCheck    (i % 250 == 0)
//!                                        └── Estimator         (i == 200 || i > 200 && i % 500 == 0)
//! ```

use std::time::Duration;

use crate::context::RunContext;
use crate::estimator::Estimator;
use crate::kmsg::{FaultScanner, FaultSignal, SPOTCHECK_WINDOW_LINES, ScanSource};
use crate::platform::Platform;

/// Progress log and spot-check cadence.
pub const PROGRESS_EVERY: u64 = 250;

/// Loop state handed to tasks after each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based index of the iteration that just completed.
    pub iteration: u64,
    pub total: u64,
    /// Monotonic time since the loop started.
    pub elapsed: Duration,
}

/// A behaviour that fires on selected iterations.
pub trait PeriodicTask {
    fn name(&self) -> &'static str;

    fn is_due(&self, iteration: u64) -> bool;

    fn on_tick(&mut self, tick: &Tick, ctx: &mut RunContext, platform: &dyn Platform);

    /// Drain kernel fault signals gathered since the last call.
    fn take_signals(&mut self) -> Vec<FaultSignal> {
        Vec::new()
    }
}

/// Logs `i/total` progress.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReporter {
    every: u64,
}

impl ProgressReporter {
    #[must_use]
    pub const fn new(every: u64) -> Self {
        Self { every }
    }
}

impl PeriodicTask for ProgressReporter {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn is_due(&self, iteration: u64) -> bool {
        self.every > 0 && iteration % self.every == 0
    }

    fn on_tick(&mut self, tick: &Tick, ctx: &mut RunContext, _platform: &dyn Platform) {
        ctx.info(format!(
            "random churn progress {}/{}",
            tick.iteration, tick.total
        ));
    }
}

/// Scans a bounded kernel-log window for controller faults. Hits are
/// warnings; the loop carries on.
#[derive(Debug, Clone)]
pub struct FaultSpotCheck {
    every: u64,
    window_lines: usize,
    scanner: FaultScanner,
    signals: Vec<FaultSignal>,
}

impl FaultSpotCheck {
    #[must_use]
    pub const fn new(every: u64, window_lines: usize, scanner: FaultScanner) -> Self {
        Self {
            every,
            window_lines,
            scanner,
            signals: Vec::new(),
        }
    }
}

impl PeriodicTask for FaultSpotCheck {
    fn name(&self) -> &'static str {
        "spotcheck"
    }

    fn is_due(&self, iteration: u64) -> bool {
        self.every > 0 && iteration % self.every == 0
    }

    fn on_tick(&mut self, tick: &Tick, ctx: &mut RunContext, platform: &dyn Platform) {
        let signals = self
            .scanner
            .scan(ScanSource::Spotcheck, self.window_lines, platform, ctx);
        if !signals.is_empty() {
            ctx.warn(format!(
                "spot-check at iteration {}: {} kernel fault line(s), continuing",
                tick.iteration,
                signals.len()
            ));
        }
        self.signals.extend(signals);
    }

    fn take_signals(&mut self) -> Vec<FaultSignal> {
        std::mem::take(&mut self.signals)
    }
}

/// Dispatches completed iterations to registered tasks.
#[derive(Default)]
pub struct IterationDriver {
    tasks: Vec<Box<dyn PeriodicTask>>,
}

impl IterationDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress every 250, spot-check every 250, ETA at 200 then every 500.
    #[must_use]
    pub fn standard(total: u64, scanner: FaultScanner) -> Self {
        Self::new()
            .with_task(ProgressReporter::new(PROGRESS_EVERY))
            .with_task(FaultSpotCheck::new(
                PROGRESS_EVERY,
                SPOTCHECK_WINDOW_LINES,
                scanner,
            ))
            .with_task(Estimator::new(total))
    }

    #[must_use]
    pub fn with_task(mut self, task: impl PeriodicTask + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|task| task.name()).collect()
    }

    /// Run every task due at `tick.iteration`; returns how many ran.
    pub fn dispatch(&mut self, tick: &Tick, ctx: &mut RunContext, platform: &dyn Platform) -> usize {
        let mut fired = 0;
        for task in &mut self.tasks {
            if task.is_due(tick.iteration) {
                task.on_tick(tick, ctx, platform);
                fired += 1;
            }
        }
        fired
    }

    /// Drain fault signals from every task, in registration order.
    pub fn take_signals(&mut self) -> Vec<FaultSignal> {
        self.tasks
            .iter_mut()
            .flat_map(|task| task.take_signals())
            .collect()
    }
}
