//! Host access seam.
//!
//! Everything the engine learns about the machine (identity, sysfs
//! attributes, free space, kernel log, mount table, filesystem metadata) and
//! every cache-control or durable-write primitive goes through [`Platform`].
//! [`LinuxPlatform`] is the production implementation; tests substitute their
//! own to inject missing devices, low space, corrupted re-reads or failing
//! writes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::fcntl::{PosixFadviseAdvice, posix_fadvise};
use nix::sys::statvfs::statvfs;
use sdqual_error::{QualError, Result};
use tracing::{debug, warn};

use crate::settings::RunSettings;

const MIB: u64 = 1024 * 1024;

/// How far a cache invalidation reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    /// Only the named file's pages were dropped.
    File,
    /// The file's pages and the global page/dentry/inode caches were dropped.
    Global,
}

/// A whole disk or one of its partitions, with its `major:minor` number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockNode {
    pub name: String,
    pub number: String,
}

/// A positioned, durable block writer.
///
/// `write_block` must not return `Ok` until the data is on stable storage.
pub trait BlockWriter {
    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

/// File opened with `O_DSYNC`: every completed write is already durable.
#[derive(Debug)]
pub struct DurableFile {
    file: File,
}

impl DurableFile {
    /// Open an existing file for in-place durable writes (no truncation).
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(path)?;
        Ok(Self { file })
    }

    /// Create (or truncate) a file for durable sequential writes.
    pub fn create(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_DSYNC)
            .open(path)
    }
}

impl BlockWriter for DurableFile {
    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }
}

/// Read-only view of the host plus the cache and write primitives the tests
/// need.
pub trait Platform {
    /// Host name used to derive the device identity.
    fn hostname(&self) -> Result<String>;

    /// Full kernel identity string.
    fn kernel_identity(&self) -> Result<String>;

    /// Kernel name of the primary block device.
    fn device_name(&self) -> &str;

    /// Sysfs directory of the primary block device.
    fn block_device_dir(&self) -> PathBuf;

    /// Whether the primary block device exists.
    fn block_device_present(&self) -> bool {
        self.block_device_dir().exists()
    }

    /// Read a sysfs attribute relative to the block device directory.
    fn block_attribute(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.block_device_dir().join(relative))
            .ok()
            .map(|raw| raw.trim().to_owned())
    }

    /// The primary device and its partitions, sorted by name.
    fn block_nodes(&self) -> Vec<BlockNode> {
        let device = self.device_name().to_owned();
        let mut nodes: Vec<BlockNode> = self
            .block_attribute("dev")
            .map(|number| BlockNode {
                name: device.clone(),
                number,
            })
            .into_iter()
            .collect();
        let Ok(entries) = fs::read_dir(self.block_device_dir()) else {
            return nodes;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&device) {
                continue;
            }
            if let Ok(raw) = fs::read_to_string(entry.path().join("dev")) {
                nodes.push(BlockNode {
                    name,
                    number: raw.trim().to_owned(),
                });
            }
        }
        nodes.sort();
        nodes
    }

    /// Free space available to unprivileged writers at `path`, in MiB.
    fn available_space_mb(&self, path: &Path) -> Result<u64>;

    /// Entire kernel ring buffer, oldest line first.
    fn kernel_log(&self) -> Result<Vec<String>>;

    /// Contents of the mount table.
    fn mount_table(&self) -> Result<String>;

    /// Per-process mount details (`mountinfo` format), which carry the
    /// `major:minor` of each mount's backing device.
    fn mount_info(&self) -> Result<String>;

    /// Superblock dump (`tune2fs -l` format) for an ext-family source.
    fn filesystem_health(&self, source: &str) -> Result<String>;

    /// Flush `path` to stable storage and evict it from memory so the next
    /// read is served by the medium.
    fn invalidate_cache(&self, path: &Path) -> Result<CacheScope>;

    /// Commit all dirty buffers system-wide.
    fn flush(&self);

    /// Open a durable in-place writer over an existing file.
    fn open_block_writer(&self, path: &Path) -> Result<Box<dyn BlockWriter>> {
        let writer = DurableFile::open(path)
            .map_err(|err| QualError::io(format!("open {}", path.display()), err))?;
        Ok(Box::new(writer))
    }
}

/// Production [`Platform`] backed by procfs, sysfs and system utilities.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    device: String,
    sysfs_root: PathBuf,
    proc_root: PathBuf,
}

impl LinuxPlatform {
    #[must_use]
    pub fn new(settings: &RunSettings) -> Self {
        Self {
            device: settings.device.clone(),
            sysfs_root: settings.sysfs_root.clone(),
            proc_root: settings.proc_root.clone(),
        }
    }

    fn read_proc(&self, relative: &str) -> Result<String> {
        let path = self.proc_root.join(relative);
        fs::read_to_string(&path)
            .map_err(|err| QualError::io(format!("read {}", path.display()), err))
    }

    fn drop_global_caches(&self) -> io::Result<()> {
        fs::write(self.proc_root.join("sys/vm/drop_caches"), b"3\n")
    }
}

impl Platform for LinuxPlatform {
    fn hostname(&self) -> Result<String> {
        Ok(self.read_proc("sys/kernel/hostname")?.trim().to_owned())
    }

    fn kernel_identity(&self) -> Result<String> {
        Ok(self.read_proc("version")?.trim().to_owned())
    }

    fn device_name(&self) -> &str {
        &self.device
    }

    fn block_device_dir(&self) -> PathBuf {
        self.sysfs_root.join("block").join(&self.device)
    }

    fn available_space_mb(&self, path: &Path) -> Result<u64> {
        let stat = statvfs(path).map_err(|errno| {
            QualError::io(format!("statvfs {}", path.display()), errno.into())
        })?;
        let bytes = u64::from(stat.blocks_available()) * u64::from(stat.fragment_size());
        Ok(bytes / MIB)
    }

    fn kernel_log(&self) -> Result<Vec<String>> {
        let output = Command::new("dmesg")
            .output()
            .map_err(|err| QualError::io("run dmesg", err))?;
        if !output.status.success() {
            return Err(QualError::io(
                "run dmesg",
                io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_owned()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect())
    }

    fn mount_table(&self) -> Result<String> {
        self.read_proc("mounts")
    }

    fn mount_info(&self) -> Result<String> {
        self.read_proc("self/mountinfo")
    }

    fn filesystem_health(&self, source: &str) -> Result<String> {
        let output = Command::new("tune2fs")
            .arg("-l")
            .arg(source)
            .output()
            .map_err(|err| QualError::io("run tune2fs", err))?;
        if !output.status.success() {
            return Err(QualError::io(
                format!("tune2fs -l {source}"),
                io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_owned()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn invalidate_cache(&self, path: &Path) -> Result<CacheScope> {
        let file = File::open(path)
            .map_err(|err| QualError::io(format!("open {}", path.display()), err))?;
        file.sync_all()
            .map_err(|err| QualError::io(format!("fsync {}", path.display()), err))?;
        posix_fadvise(
            file.as_raw_fd(),
            0,
            0,
            PosixFadviseAdvice::POSIX_FADV_DONTNEED,
        )
        .map_err(|errno| QualError::io(format!("fadvise {}", path.display()), errno.into()))?;
        drop(file);

        nix::unistd::sync();
        match self.drop_global_caches() {
            Ok(()) => {
                debug!(path = %path.display(), "global caches dropped");
                Ok(CacheScope::Global)
            }
            Err(err) => {
                warn!(error = %err, "drop_caches unavailable, relying on per-file eviction");
                Ok(CacheScope::File)
            }
        }
    }

    fn flush(&self) {
        nix::unistd::sync();
    }
}
