//! Run identity, the append-only run log, and the scratch directory.
//!
//! One [`RunContext`] exists per process. It is created by the caller,
//! handed to the orchestrator, and threaded by `&mut` through every phase.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use sdqual_error::{QualError, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::platform::Platform;
use crate::settings::RunSettings;

/// Severity of a run-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Append-only, line-oriented run log.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
    write_failures: u64,
}

impl LogSink {
    /// Open `path` for appending, creating it when missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| QualError::io(format!("open log {}", path.display()), err))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            write_failures: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines that could not be persisted so far.
    #[must_use]
    pub const fn write_failures(&self) -> u64 {
        self.write_failures
    }

    fn append(&mut self, line: &str) {
        let outcome = writeln!(self.file, "{line}").and_then(|()| self.file.flush());
        if let Err(err) = outcome {
            self.write_failures = self.write_failures.saturating_add(1);
            error!(log = %self.path.display(), error = %err, "run log append failed");
        }
    }
}

/// Per-run identity and shared sinks.
#[derive(Debug)]
pub struct RunContext {
    device_id: String,
    started_at: DateTime<Local>,
    started: Instant,
    log: LogSink,
    work_dir: PathBuf,
}

impl RunContext {
    /// Derive the device identity, open the run log and create the scratch
    /// directory.
    ///
    /// Concurrent runs against the same work directory are not supported.
    pub fn open(settings: &RunSettings, platform: &dyn Platform) -> Result<Self> {
        let device_id = match platform.hostname() {
            Ok(name) => device_id_from_hostname(&name),
            Err(err) => {
                warn!(error = %err, "hostname unavailable");
                "unknown".to_owned()
            }
        };
        let started_at = Local::now();

        fs::create_dir_all(&settings.log_dir).map_err(|err| {
            QualError::io(
                format!("create log dir {}", settings.log_dir.display()),
                err,
            )
        })?;
        let log_path = settings
            .log_dir
            .join(log_file_name(&device_id, &started_at));
        let log = LogSink::open(&log_path)?;

        fs::create_dir_all(&settings.work_dir).map_err(|err| {
            QualError::io(
                format!("create work dir {}", settings.work_dir.display()),
                err,
            )
        })?;

        let mut ctx = Self {
            device_id,
            started_at,
            started: Instant::now(),
            log,
            work_dir: settings.work_dir.clone(),
        };
        ctx.info(format!(
            "run start device={} log={} work_dir={}",
            ctx.device_id,
            ctx.log.path().display(),
            ctx.work_dir.display()
        ));
        Ok(ctx)
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub const fn started_at(&self) -> &DateTime<Local> {
        &self.started_at
    }

    /// Monotonic time since the context was opened.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    #[must_use]
    pub fn log_write_failures(&self) -> u64 {
        self.log.write_failures()
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path of a named scratch artifact inside the work directory.
    #[must_use]
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    /// Append a timestamped line to the run log and mirror it to tracing.
    pub fn record(&mut self, level: Level, message: impl AsRef<str>) {
        let message = message.as_ref();
        match level {
            Level::Info => info!(device = %self.device_id, "{message}"),
            Level::Warn => warn!(device = %self.device_id, "{message}"),
            Level::Error => error!(device = %self.device_id, "{message}"),
        }
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.log
            .append(&format!("[{stamp}] {} {message}", level.as_str()));
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.record(Level::Info, message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.record(Level::Warn, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.record(Level::Error, message);
    }
}

/// First DNS label of the host name, or `unknown`.
#[must_use]
pub fn device_id_from_hostname(hostname: &str) -> String {
    let label = hostname.trim().split('.').next().unwrap_or_default();
    if label.is_empty() {
        "unknown".to_owned()
    } else {
        label.to_owned()
    }
}

/// `sdqual_<device>_<YYYYmmdd_HHMMSS>.log`, with the device segment
/// restricted to `[A-Za-z0-9_-]`.
#[must_use]
pub fn log_file_name(device_id: &str, started_at: &DateTime<Local>) -> String {
    let device: String = device_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "sdqual_{device}_{}.log",
        started_at.format("%Y%m%d_%H%M%S")
    )
}
