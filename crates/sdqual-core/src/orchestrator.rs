//! Fixed-sequence run driver.
//!
//! ```text
//! INIT → PROBED → SPACE_OK → SCANNED_PRE → SEQ_OK → CHURN_OK
//!      → SCANNED_POST → FS_REPORTED → DONE
//! ```
//!
//! The first fatal error moves the run to `FAILED(phase, exit_code)` and
//! skips every remaining phase. Whatever happened, exactly one `VERDICT`
//! line is appended to the run log as the last action.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use rand::SeedableRng;
use rand::rngs::StdRng;
use sdqual_error::{EXIT_PASS, QualError};
use serde::Serialize;

use crate::churn::{self, ChurnOutcome, POOL_FILE};
use crate::context::RunContext;
use crate::estimator::format_duration;
use crate::fsreport::{self, FsReport};
use crate::kmsg::{FaultScanner, FaultSignal, PHASE_WINDOW_LINES, ScanSource};
use crate::periodic::IterationDriver;
use crate::plan::TestPlan;
use crate::platform::Platform;
use crate::preflight::{self, SpaceCheck};
use crate::probe::{self, DeviceSnapshot};
use crate::sequential::{self, SEQUENTIAL_FILE, SequentialOutcome};

/// Prefix of the final record.
pub const VERDICT_PREFIX: &str = "VERDICT";

/// Run phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Probe,
    Preflight,
    ScanPre,
    Sequential,
    Churn,
    ScanPost,
    FsReport,
}

impl Phase {
    pub const ALL: [Self; 7] = [
        Self::Probe,
        Self::Preflight,
        Self::ScanPre,
        Self::Sequential,
        Self::Churn,
        Self::ScanPost,
        Self::FsReport,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Preflight => "preflight",
            Self::ScanPre => "scan_pre",
            Self::Sequential => "sequential",
            Self::Churn => "churn",
            Self::ScanPost => "scan_post",
            Self::FsReport => "fs_report",
        }
    }

    /// State reached when this phase completes.
    #[must_use]
    pub const fn completes_to(self) -> RunState {
        match self {
            Self::Probe => RunState::Probed,
            Self::Preflight => RunState::SpaceOk,
            Self::ScanPre => RunState::ScannedPre,
            Self::Sequential => RunState::SeqOk,
            Self::Churn => RunState::ChurnOk,
            Self::ScanPost => RunState::ScannedPost,
            Self::FsReport => RunState::FsReported,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Init,
    Probed,
    SpaceOk,
    ScannedPre,
    SeqOk,
    ChurnOk,
    ScannedPost,
    FsReported,
    Done,
    Failed { phase: Phase, exit_code: u8 },
}

impl RunState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

/// The single final record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_phase: Option<Phase>,
    pub exit_code: u8,
}

impl Verdict {
    #[must_use]
    pub fn pass(device_id: &str) -> Self {
        Self {
            status: VerdictStatus::Pass,
            device_id: device_id.to_owned(),
            failing_phase: None,
            exit_code: EXIT_PASS,
        }
    }

    #[must_use]
    pub fn fail(device_id: &str, phase: Phase, exit_code: u8) -> Self {
        Self {
            status: VerdictStatus::Fail,
            device_id: device_id.to_owned(),
            failing_phase: Some(phase),
            exit_code,
        }
    }

    /// Failure before any phase started, such as a run log that could not
    /// be opened.
    #[must_use]
    pub fn aborted(device_id: &str, exit_code: u8) -> Self {
        Self {
            status: VerdictStatus::Fail,
            device_id: device_id.to_owned(),
            failing_phase: None,
            exit_code,
        }
    }

    /// `VERDICT {"status":"PASS",...}`
    #[must_use]
    pub fn line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|err| {
            format!(
                "{{\"status\":\"FAIL\",\"device_id\":\"{}\",\"exit_code\":{},\"serialize_error\":\"{err}\"}}",
                self.device_id, self.exit_code
            )
        });
        format!("{VERDICT_PREFIX} {json}")
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub verdict: Verdict,
    pub state: RunState,
    pub log_path: PathBuf,
    pub snapshot: Option<DeviceSnapshot>,
    pub space: Option<SpaceCheck>,
    pub sequential: Option<SequentialOutcome>,
    pub churn: Option<ChurnOutcome>,
    /// Kernel fault signals from every scan, in scan order.
    pub fault_signals: Vec<FaultSignal>,
    /// How many of `fault_signals` came from in-loop spot-checks.
    pub spotcheck_signals: usize,
    pub fs_report: Option<FsReport>,
}

impl RunOutcome {
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.verdict.exit_code
    }
}

struct PhaseFailure {
    phase: Phase,
    error: QualError,
}

trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> Result<T, PhaseFailure>;
}

impl<T> InPhase<T> for sdqual_error::Result<T> {
    fn in_phase(self, phase: Phase) -> Result<T, PhaseFailure> {
        self.map_err(|error| PhaseFailure { phase, error })
    }
}

/// Drives one run over a resolved plan.
pub struct Orchestrator<'p> {
    plan: TestPlan,
    platform: &'p dyn Platform,
    ctx: RunContext,
    scanner: FaultScanner,
    seed: Option<u64>,
    state: RunState,
}

impl<'p> Orchestrator<'p> {
    #[must_use]
    pub fn new(plan: TestPlan, platform: &'p dyn Platform, ctx: RunContext) -> Self {
        Self {
            plan,
            platform,
            ctx,
            scanner: FaultScanner::default(),
            seed: None,
            state: RunState::Init,
        }
    }

    /// Deterministic payload and block selection.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_scanner(mut self, scanner: FaultScanner) -> Self {
        self.scanner = scanner;
        self
    }

    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Execute every phase, then write the verdict.
    pub fn run(mut self) -> RunOutcome {
        let mut rng = self
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let mut outcome = RunOutcome {
            verdict: Verdict::pass(self.ctx.device_id()),
            state: RunState::Init,
            log_path: self.ctx.log_path().to_path_buf(),
            snapshot: None,
            space: None,
            sequential: None,
            churn: None,
            fault_signals: Vec::new(),
            spotcheck_signals: 0,
            fs_report: None,
        };

        self.ctx.info(format!("test plan: {}", self.plan));
        let verdict = match self.execute(&mut rng, &mut outcome) {
            Ok(()) => {
                self.state = RunState::Done;
                self.ctx.info(format!(
                    "all phases passed in {}",
                    format_duration(self.ctx.elapsed())
                ));
                Verdict::pass(self.ctx.device_id())
            }
            Err(PhaseFailure { phase, error }) => {
                let exit_code = error.exit_code();
                self.state = RunState::Failed { phase, exit_code };
                self.ctx.error(format!(
                    "FAIL phase={phase} kind={} exit={exit_code}: {error}",
                    error.kind()
                ));
                self.sweep_scratch(&error);
                Verdict::fail(self.ctx.device_id(), phase, exit_code)
            }
        };

        if self.ctx.log_write_failures() > 0 {
            self.ctx.warn(format!(
                "{} run log line(s) could not be written",
                self.ctx.log_write_failures()
            ));
        }
        self.ctx.info(verdict.line());

        outcome.verdict = verdict;
        outcome.state = self.state;
        outcome
    }

    fn execute(&mut self, rng: &mut StdRng, outcome: &mut RunOutcome) -> Result<(), PhaseFailure> {
        let snapshot = probe::probe(self.platform, &mut self.ctx).in_phase(Phase::Probe)?;
        outcome.snapshot = Some(snapshot);
        self.complete(Phase::Probe);

        let space = preflight::check_capacity(&self.plan, self.platform, &mut self.ctx)
            .in_phase(Phase::Preflight)?;
        outcome.space = Some(space);
        self.complete(Phase::Preflight);

        let signals = self.scanner.scan(
            ScanSource::Preflight,
            PHASE_WINDOW_LINES,
            self.platform,
            &mut self.ctx,
        );
        outcome.fault_signals.extend(signals);
        self.complete(Phase::ScanPre);

        let seq = sequential::run(&self.plan, self.platform, &mut self.ctx, rng)
            .in_phase(Phase::Sequential)?;
        outcome.sequential = Some(seq);
        self.complete(Phase::Sequential);

        let mut driver = IterationDriver::standard(self.plan.random_iterations, self.scanner.clone());
        let churned = churn::run(&self.plan, self.platform, &mut self.ctx, rng, &mut driver);
        let spotted = driver.take_signals();
        outcome.spotcheck_signals = spotted.len();
        outcome.fault_signals.extend(spotted);
        let churned = churned.in_phase(Phase::Churn)?;
        outcome.churn = Some(churned);
        self.complete(Phase::Churn);

        let signals = self.scanner.scan(
            ScanSource::Postflight,
            PHASE_WINDOW_LINES,
            self.platform,
            &mut self.ctx,
        );
        outcome.fault_signals.extend(signals);
        self.complete(Phase::ScanPost);

        outcome.fs_report = Some(fsreport::report(self.platform, &mut self.ctx));
        self.complete(Phase::FsReport);
        Ok(())
    }

    fn complete(&mut self, phase: Phase) {
        self.state = phase.completes_to();
        tracing::debug!(phase = %phase, state = ?self.state, "phase complete");
    }

    /// Best-effort removal of leftover scratch files. The sequential file is
    /// kept after an integrity mismatch.
    fn sweep_scratch(&mut self, error: &QualError) {
        for name in [SEQUENTIAL_FILE, POOL_FILE] {
            let path = self.ctx.scratch_path(name);
            if !path.exists() {
                continue;
            }
            if error.is_integrity_failure() && name == SEQUENTIAL_FILE {
                self.ctx.warn(format!(
                    "retaining {} as integrity evidence",
                    path.display()
                ));
                continue;
            }
            if let Err(err) = fs::remove_file(&path) {
                self.ctx
                    .warn(format!("could not remove {}: {err}", path.display()));
            }
        }
    }
}
