//! Error taxonomy for the storage quality test.
//!
//! Every fatal condition the engine can hit is a [`QualError`] variant.
//! Translation to the process exit status happens in exactly one place,
//! [`QualError::exit_code`], so the numeric contract consumed by fleet
//! tooling lives next to the variants it describes.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;

/// Exit status of a passing run.
pub const EXIT_PASS: u8 = 0;
/// Exit status for usage, configuration and environment errors, including
/// I/O failures outside the churn loop.
pub const EXIT_USAGE: u8 = 1;
/// Exit status when the primary storage device is absent.
pub const EXIT_DEVICE_NOT_FOUND: u8 = 2;
/// Exit status when the scratch filesystem lacks room for the plan.
pub const EXIT_INSUFFICIENT_SPACE: u8 = 3;
/// Exit status for a sequential read-back digest mismatch.
pub const EXIT_SEQUENTIAL_INTEGRITY: u8 = 4;
/// Exit status for a failed durable write during the churn phase.
pub const EXIT_RANDOM_WRITE: u8 = 5;

/// Primary error type for sdqual.
#[derive(Debug, thiserror::Error)]
pub enum QualError {
    /// Bad command-line flag or value.
    #[error("usage error: {0}")]
    Usage(String),

    /// Resolved test plan violates a plan invariant.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The expected primary block device is not present.
    #[error("expected storage device {device} not found at {}", .path.display())]
    DeviceNotFound { device: String, path: PathBuf },

    /// Free space is below what the plan needs.
    #[error("insufficient free space: required {required_mb}MB, available {available_mb}MB")]
    InsufficientSpace { required_mb: u64, available_mb: u64 },

    /// Re-read digest differs from the digest taken while writing.
    #[error(
        "sequential integrity mismatch on {}: written={written} reread={reread}",
        .scratch.display()
    )]
    SequentialIntegrity {
        written: String,
        reread: String,
        scratch: PathBuf,
    },

    /// A durable block write failed during the churn phase.
    #[error("random write failed at iteration {iteration}: {source}")]
    RandomWrite {
        iteration: u64,
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure, tagged with what was being attempted.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Invariant breach inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QualError {
    /// Wrap an I/O error with a short description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Build a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// The externally documented process exit status for this error.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::DeviceNotFound { .. } => EXIT_DEVICE_NOT_FOUND,
            Self::InsufficientSpace { .. } => EXIT_INSUFFICIENT_SPACE,
            Self::SequentialIntegrity { .. } => EXIT_SEQUENTIAL_INTEGRITY,
            Self::RandomWrite { .. } => EXIT_RANDOM_WRITE,
            Self::Usage(_) | Self::Configuration(_) | Self::Io { .. } | Self::Internal(_) => {
                EXIT_USAGE
            }
        }
    }

    /// Whether scratch artifacts must be kept as evidence.
    pub const fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::SequentialIntegrity { .. })
    }

    /// Coarse classification used in the run log.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Usage(_) | Self::Configuration(_) => ErrorKind::Usage,
            Self::DeviceNotFound { .. } | Self::InsufficientSpace { .. } => {
                ErrorKind::Precondition
            }
            Self::SequentialIntegrity { .. } => ErrorKind::Integrity,
            Self::RandomWrite { .. } => ErrorKind::Write,
            Self::Io { .. } | Self::Internal(_) => ErrorKind::Environment,
        }
    }
}

/// Error classes from the operator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Usage,
    Precondition,
    Integrity,
    Write,
    Environment,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Usage => "usage",
            Self::Precondition => "precondition",
            Self::Integrity => "integrity",
            Self::Write => "write",
            Self::Environment => "environment",
        };
        f.write_str(name)
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, QualError>;
