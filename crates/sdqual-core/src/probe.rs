//! Static device and environment facts, captured once per run.

use sdqual_error::{QualError, Result};
use serde::Serialize;

use crate::context::RunContext;
use crate::platform::Platform;

/// Sysfs reports capacity in 512-byte sectors regardless of the card's
/// native block size.
const SECTOR_BYTES: u64 = 512;

/// Immutable identity record of the device under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub kernel: String,
    pub block_device: String,
    pub cid: String,
    pub name: String,
    pub manfid: String,
    pub oemid: String,
    pub sectors: u64,
}

impl DeviceSnapshot {
    #[must_use]
    pub const fn capacity_mb(&self) -> u64 {
        self.sectors * SECTOR_BYTES / (1024 * 1024)
    }

    /// Log lines describing the snapshot, one fact per line.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("device_id: {}", self.device_id),
            format!("kernel: {}", self.kernel),
            format!("block_device: {}", self.block_device),
            format!("cid: {}", self.cid),
            format!("name: {}", self.name),
            format!("manfid: {}", self.manfid),
            format!("oemid: {}", self.oemid),
            format!("sectors: {} ({} MB)", self.sectors, self.capacity_mb()),
        ]
    }
}

/// Whether `id` follows the fleet naming convention: `ss` plus two digits.
#[must_use]
pub fn is_conventional_device_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    bytes.len() == 4 && bytes.starts_with(b"ss") && bytes[2..].iter().all(u8::is_ascii_digit)
}

/// Capture the [`DeviceSnapshot`] and log it.
///
/// Fails with [`QualError::DeviceNotFound`] when the primary block device is
/// absent. A non-conventional device identity is only a warning.
pub fn probe(platform: &dyn Platform, ctx: &mut RunContext) -> Result<DeviceSnapshot> {
    if !is_conventional_device_id(ctx.device_id()) {
        ctx.warn(format!(
            "device id '{}' does not match the ssNN naming convention",
            ctx.device_id()
        ));
    }

    if !platform.block_device_present() {
        return Err(QualError::DeviceNotFound {
            device: platform.device_name().to_owned(),
            path: platform.block_device_dir(),
        });
    }

    let kernel = platform.kernel_identity().unwrap_or_else(|err| {
        ctx.warn(format!("kernel identity unavailable: {err}"));
        "unknown".to_owned()
    });
    let attribute = |relative: &str| {
        platform
            .block_attribute(relative)
            .unwrap_or_else(|| "unknown".to_owned())
    };
    let raw_size = platform.block_attribute("size");
    let sectors = match raw_size.as_deref().map(str::parse::<u64>) {
        Some(Ok(sectors)) => sectors,
        other => {
            ctx.warn(format!("unreadable sector count: {other:?}"));
            0
        }
    };

    let snapshot = DeviceSnapshot {
        device_id: ctx.device_id().to_owned(),
        kernel,
        block_device: platform.device_name().to_owned(),
        cid: attribute("device/cid"),
        name: attribute("device/name"),
        manfid: attribute("device/manfid"),
        oemid: attribute("device/oemid"),
        sectors,
    };
    for line in snapshot.lines() {
        ctx.info(line);
    }
    Ok(snapshot)
}
