//! Kernel ring-buffer fault scanning.
//!
//! Storage-controller trouble often shows up in the kernel log long before
//! it corrupts user data. The scanner matches the most recent lines against
//! a closed set of typed [`FaultRule`]s and reports every hit as an advisory
//! [`FaultSignal`]; it never fails a run on its own.
//!
//! Rules are evaluated in table order and the first match classifies a line,
//! so the most specific signatures (controller error codes) come first and
//! the broad subsystem identifiers last.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::context::RunContext;
use crate::platform::Platform;

/// Window used for the preflight and postflight scans.
pub const PHASE_WINDOW_LINES: usize = 200;

/// Window used for spot-checks inside the churn loop.
pub const SPOTCHECK_WINDOW_LINES: usize = 50;

/// Where in the run a scan was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    Preflight,
    Spotcheck,
    Postflight,
}

impl fmt::Display for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Preflight => "preflight",
            Self::Spotcheck => "spotcheck",
            Self::Postflight => "postflight",
        })
    }
}

/// Class of kernel-reported storage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    /// `-110` (ETIMEDOUT) from the host controller: command timeout.
    ControllerTimeout,
    /// `-84` (EILSEQ) from the host controller: bus communication failure.
    ControllerCommunication,
    Crc,
    Timeout,
    IoError,
    /// Any line from the SD/MMC stack.
    StorageSubsystem,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ControllerTimeout => "controller_timeout",
            Self::ControllerCommunication => "controller_communication",
            Self::Crc => "crc",
            Self::Timeout => "timeout",
            Self::IoError => "io_error",
            Self::StorageSubsystem => "storage_subsystem",
        })
    }
}

/// One signature: a category and the lowercase substrings that indicate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRule {
    pub category: FaultCategory,
    pub needles: &'static [&'static str],
}

impl FaultRule {
    /// `lowered` must already be ASCII-lowercased.
    #[must_use]
    pub fn matches(&self, lowered: &str) -> bool {
        self.needles.iter().any(|needle| lowered.contains(needle))
    }
}

/// Built-in signatures, most specific first.
pub const DEFAULT_RULES: &[FaultRule] = &[
    FaultRule {
        category: FaultCategory::ControllerTimeout,
        needles: &["-110"],
    },
    FaultRule {
        category: FaultCategory::ControllerCommunication,
        needles: &["-84"],
    },
    FaultRule {
        category: FaultCategory::Crc,
        needles: &["crc"],
    },
    FaultRule {
        category: FaultCategory::Timeout,
        needles: &["timeout", "timed out"],
    },
    FaultRule {
        category: FaultCategory::IoError,
        needles: &["i/o error", "io error"],
    },
    FaultRule {
        category: FaultCategory::StorageSubsystem,
        needles: &["mmc", "sdhci"],
    },
];

/// A kernel log line that matched a fault rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultSignal {
    pub source: ScanSource,
    pub category: FaultCategory,
    pub matched_line: String,
}

/// Rule-driven kernel log scanner.
#[derive(Debug, Clone)]
pub struct FaultScanner {
    rules: Vec<FaultRule>,
}

impl Default for FaultScanner {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }
}

impl FaultScanner {
    /// Append a signature; it is consulted after the existing ones.
    #[must_use]
    pub fn with_rule(mut self, rule: FaultRule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn classify(&self, line: &str) -> Option<FaultCategory> {
        let lowered = line.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.category)
    }

    /// Match the last `window_lines` entries of `lines`. Identical lines are
    /// reported once.
    #[must_use]
    pub fn match_lines(
        &self,
        source: ScanSource,
        lines: &[String],
        window_lines: usize,
    ) -> Vec<FaultSignal> {
        let start = lines.len().saturating_sub(window_lines);
        let mut seen = HashSet::new();
        lines[start..]
            .iter()
            .filter(|line| seen.insert(line.as_str()))
            .filter_map(|line| {
                self.classify(line).map(|category| FaultSignal {
                    source,
                    category,
                    matched_line: line.clone(),
                })
            })
            .collect()
    }

    /// Read the kernel log, match the recent window and log every hit as a
    /// warning. An unreadable kernel log is logged and yields no signals.
    pub fn scan(
        &self,
        source: ScanSource,
        window_lines: usize,
        platform: &dyn Platform,
        ctx: &mut RunContext,
    ) -> Vec<FaultSignal> {
        let lines = match platform.kernel_log() {
            Ok(lines) => lines,
            Err(err) => {
                ctx.warn(format!("kernel scan {source}: kernel log unavailable: {err}"));
                return Vec::new();
            }
        };
        let signals = self.match_lines(source, &lines, window_lines);
        if signals.is_empty() {
            return signals;
        }
        for signal in &signals {
            ctx.warn(format!(
                "kernel fault [{source}/{}]: {}",
                signal.category, signal.matched_line
            ));
        }
        ctx.warn(format!(
            "kernel scan {source}: {} suspicious line(s) ({})",
            signals.len(),
            summarize(&signals)
        ));
        signals
    }
}

/// `category=count` pairs in category order.
#[must_use]
pub fn summarize(signals: &[FaultSignal]) -> String {
    let mut counts: BTreeMap<FaultCategory, usize> = BTreeMap::new();
    for signal in signals {
        *counts.entry(signal.category).or_default() += 1;
    }
    counts
        .iter()
        .map(|(category, count)| format!("{category}={count}"))
        .collect::<Vec<_>>()
        .join(", ")
}
