//! Root filesystem sanity report. Advisory only.

use serde::Serialize;

use crate::context::RunContext;
use crate::platform::Platform;

/// Filesystem types whose superblock health can be dumped.
const INTROSPECTABLE_TYPES: [&str; 3] = ["ext2", "ext3", "ext4"];

/// Source and type of the filesystem mounted at `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootMount {
    pub source: String,
    pub fstype: String,
}

/// Health fields from an ext superblock dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsHealth {
    pub state: Option<String>,
    pub errors_behavior: Option<String>,
    pub last_mount: Option<String>,
    pub last_checked: Option<String>,
    pub mount_count: Option<u64>,
    pub max_mount_count: Option<i64>,
}

impl FsHealth {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.state.as_deref() == Some("clean")
    }
}

/// What the reporter concluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FsReport {
    /// Mount table or superblock could not be read.
    Unavailable { reason: String },
    /// Root is not backed by a partition of the primary device.
    OtherDevice { mount: RootMount },
    /// Root filesystem type has no introspectable health metadata.
    Unsupported { mount: RootMount },
    /// `device` is the partition node the superblock was read from.
    Inspected {
        mount: RootMount,
        device: String,
        health: FsHealth,
    },
}

/// Find the filesystem mounted at `/` in `/proc/mounts` format. The last
/// entry wins, matching how the kernel stacks over-mounts.
#[must_use]
pub fn root_mount(mounts: &str) -> Option<RootMount> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            (target == "/").then(|| RootMount {
                source: source.to_owned(),
                fstype: fstype.to_owned(),
            })
        })
        .filter(|mount| mount.fstype != "rootfs")
        .last()
}

/// Whether `source` names `device` itself or one of its partitions
/// (`/dev/mmcblk0p2`, `/dev/sda1`).
#[must_use]
pub fn is_partition_of(source: &str, device: &str) -> bool {
    let Some(rest) = source
        .strip_prefix("/dev/")
        .and_then(|name| name.strip_prefix(device))
    else {
        return false;
    };
    let digits = rest.strip_prefix('p').unwrap_or(rest);
    digits.chars().all(|ch| ch.is_ascii_digit())
}

/// `major:minor` of the device backing `/`, from `mountinfo` text. The
/// last entry wins, as in [`root_mount`].
#[must_use]
pub fn root_device_number(mountinfo: &str) -> Option<String> {
    mountinfo.lines().rev().find_map(|line| {
        let mut fields = line.split_whitespace();
        let number = fields.nth(2)?;
        let mount_point = fields.nth(1)?;
        (mount_point == "/").then(|| number.to_owned())
    })
}

/// Device node of the primary-device partition that backs the root mount.
///
/// Kernels that mount root straight from `root=` without an initramfs list
/// the source as `/dev/root`; those are matched by device number instead.
fn backing_partition(
    platform: &dyn Platform,
    mount: &RootMount,
    ctx: &mut RunContext,
) -> Option<String> {
    if is_partition_of(&mount.source, platform.device_name()) {
        return Some(mount.source.clone());
    }
    let info = match platform.mount_info() {
        Ok(info) => info,
        Err(err) => {
            ctx.warn(format!("filesystem report: mountinfo unavailable: {err}"));
            return None;
        }
    };
    let number = root_device_number(&info)?;
    let node = platform
        .block_nodes()
        .into_iter()
        .find(|node| node.number == number)?;
    let resolved = format!("/dev/{}", node.name);
    ctx.info(format!(
        "root source {} resolved to {resolved} (device {number})",
        mount.source
    ));
    Some(resolved)
}

/// Parse the `key: value` lines of a `tune2fs -l` dump.
#[must_use]
pub fn parse_superblock_dump(text: &str) -> FsHealth {
    let mut health = FsHealth::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Filesystem state" => health.state = Some(value.to_owned()),
            "Errors behavior" => health.errors_behavior = Some(value.to_owned()),
            "Last mount time" => health.last_mount = Some(value.to_owned()),
            "Last checked" => health.last_checked = Some(value.to_owned()),
            "Mount count" => health.mount_count = value.parse().ok(),
            "Maximum mount count" => health.max_mount_count = value.parse().ok(),
            _ => {}
        }
    }
    health
}

/// Inspect the root filesystem and log what was found.
pub fn report(platform: &dyn Platform, ctx: &mut RunContext) -> FsReport {
    let table = match platform.mount_table() {
        Ok(table) => table,
        Err(err) => {
            ctx.warn(format!("filesystem report: mount table unavailable: {err}"));
            return FsReport::Unavailable {
                reason: err.to_string(),
            };
        }
    };
    let Some(mount) = root_mount(&table) else {
        ctx.warn("filesystem report: no root mount found");
        return FsReport::Unavailable {
            reason: "no root mount".to_owned(),
        };
    };
    ctx.info(format!(
        "root filesystem: source={} type={}",
        mount.source, mount.fstype
    ));

    let Some(device) = backing_partition(platform, &mount, ctx) else {
        ctx.info(format!(
            "root filesystem is not on {}; skipping health dump",
            platform.device_name()
        ));
        return FsReport::OtherDevice { mount };
    };
    if !INTROSPECTABLE_TYPES.contains(&mount.fstype.as_str()) {
        ctx.info(format!(
            "filesystem type {} has no health metadata to report",
            mount.fstype
        ));
        return FsReport::Unsupported { mount };
    }

    let dump = match platform.filesystem_health(&device) {
        Ok(dump) => dump,
        Err(err) => {
            ctx.warn(format!("filesystem report: {err}"));
            return FsReport::Unavailable {
                reason: err.to_string(),
            };
        }
    };
    let health = parse_superblock_dump(&dump);
    let show = |value: &Option<String>| value.clone().unwrap_or_else(|| "unknown".to_owned());
    ctx.info(format!(
        "fs state={} errors={} last_mount={} last_checked={} mount_count={}/{}",
        show(&health.state),
        show(&health.errors_behavior),
        show(&health.last_mount),
        show(&health.last_checked),
        health
            .mount_count
            .map_or_else(|| "unknown".to_owned(), |count| count.to_string()),
        health
            .max_mount_count
            .map_or_else(|| "unknown".to_owned(), |count| count.to_string()),
    ));
    if !health.is_clean() {
        ctx.warn(format!(
            "root filesystem not clean (state={})",
            show(&health.state)
        ));
    }
    FsReport::Inspected {
        mount,
        device,
        health,
    }
}
