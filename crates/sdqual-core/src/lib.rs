//! Storage-media qualification engine.
//!
//! A run probes the primary block device, checks free space, writes a
//! sequential payload and verifies it after cache invalidation, then churns
//! random in-place block writes while watching the kernel log. The first
//! fatal failure ends the run with a distinct exit code. All host access goes
//! through [`Platform`] so every failure mode can be reproduced in tests.

pub mod churn;
pub mod context;
pub mod estimator;
pub mod fsreport;
pub mod kmsg;
pub mod orchestrator;
pub mod periodic;
pub mod plan;
pub mod platform;
pub mod preflight;
pub mod probe;
pub mod sequential;
pub mod settings;

pub use context::{Level, RunContext};
pub use kmsg::{FaultCategory, FaultRule, FaultScanner, FaultSignal, ScanSource};
pub use orchestrator::{Orchestrator, Phase, RunOutcome, RunState, Verdict, VerdictStatus};
pub use periodic::{IterationDriver, PeriodicTask, Tick};
pub use plan::{Preset, PlanOverride, TestPlan, resolve};
pub use platform::{BlockNode, BlockWriter, CacheScope, DurableFile, LinuxPlatform, Platform};
pub use settings::RunSettings;
