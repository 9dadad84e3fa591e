//! Where a run reads from and writes to.

use std::path::{Path, PathBuf};

use serde::Serialize;

pub const DEFAULT_LOG_DIR: &str = "/var/log/sdqual";
pub const DEFAULT_WORK_DIR: &str = "/var/tmp/sdqual";
pub const DEFAULT_DEVICE: &str = "mmcblk0";

/// Filesystem locations and the primary device name for a run.
///
/// The scratch directory must live on the filesystem under test; free space
/// is measured there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSettings {
    pub log_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Kernel name of the primary block device, e.g. `mmcblk0`.
    pub device: String,
    pub sysfs_root: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            device: DEFAULT_DEVICE.to_owned(),
            sysfs_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl RunSettings {
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// Point sysfs and procfs reads at alternate roots (fixture trees).
    #[must_use]
    pub fn with_system_roots(
        mut self,
        sysfs_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        self.sysfs_root = sysfs_root.into();
        self.proc_root = proc_root.into();
        self
    }

    /// Sysfs directory of the primary block device.
    #[must_use]
    pub fn block_device_dir(&self) -> PathBuf {
        self.sysfs_root.join("block").join(&self.device)
    }

    #[must_use]
    pub fn proc_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.proc_root.join(relative)
    }
}
