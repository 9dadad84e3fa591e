//! End-to-end runs against an injectable host.
//!
//! Each scenario drives a full [`Orchestrator`] run over a fake platform and
//! checks the exit code, the verdict record, the run log and what is left in
//! the scratch directory.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sdqual_core::churn::POOL_FILE;
use sdqual_core::sequential::SEQUENTIAL_FILE;
use sdqual_core::{
    BlockWriter, CacheScope, DurableFile, Orchestrator, Phase, Platform, PlanOverride, Preset,
    RunContext, RunSettings, RunState, ScanSource, VerdictStatus, resolve,
};
use sdqual_core::fsreport::FsReport;
use sdqual_error::{QualError, Result};
use tempfile::TempDir;

// -------------------------------------------------------------------------
// Fake host
// -------------------------------------------------------------------------

struct FakeHost {
    hostname: String,
    device_dir: PathBuf,
    device_present: bool,
    free_mb: u64,
    kernel_lines: Vec<String>,
    mounts: String,
    mountinfo: String,
    superblock: String,
    /// Source last handed to the superblock dump.
    inspected_source: RefCell<Option<String>>,
    corrupt_reread: bool,
    fail_write_at: Option<u64>,
    invalidations: Cell<u32>,
}

impl FakeHost {
    fn healthy(root: &Path) -> Self {
        Self {
            hostname: "ss07".to_owned(),
            device_dir: root.join("sys/block/mmcblk0"),
            device_present: true,
            free_mb: 16_000,
            kernel_lines: vec![
                "[    0.000] Booting Linux on physical CPU 0x0000000000 [0x410fd083]".to_owned(),
                "[    2.115] random: crng init done".to_owned(),
            ],
            mounts: "/dev/mmcblk0p2 / ext4 rw,noatime 0 0\n".to_owned(),
            mountinfo: "28 1 179:2 / / rw,noatime shared:1 - ext4 /dev/mmcblk0p2 rw\n".to_owned(),
            superblock: "Filesystem state:         clean\nMount count:              3\n".to_owned(),
            inspected_source: RefCell::new(None),
            corrupt_reread: false,
            fail_write_at: None,
            invalidations: Cell::new(0),
        }
    }
}

impl Platform for FakeHost {
    fn hostname(&self) -> Result<String> {
        Ok(self.hostname.clone())
    }

    fn kernel_identity(&self) -> Result<String> {
        Ok("Linux version 6.6.31+rpt-rpi-v8".to_owned())
    }

    fn device_name(&self) -> &str {
        "mmcblk0"
    }

    fn block_device_dir(&self) -> PathBuf {
        self.device_dir.clone()
    }

    fn block_device_present(&self) -> bool {
        self.device_present
    }

    fn block_attribute(&self, relative: &str) -> Option<String> {
        match relative {
            "device/cid" => Some("035344534433324780f1c3a5b6014600".to_owned()),
            "device/name" => Some("SD32G".to_owned()),
            "device/manfid" => Some("0x000003".to_owned()),
            "device/oemid" => Some("0x5344".to_owned()),
            "size" => Some("62333952".to_owned()),
            _ => None,
        }
    }

    fn available_space_mb(&self, _path: &Path) -> Result<u64> {
        Ok(self.free_mb)
    }

    fn kernel_log(&self) -> Result<Vec<String>> {
        Ok(self.kernel_lines.clone())
    }

    fn mount_table(&self) -> Result<String> {
        Ok(self.mounts.clone())
    }

    fn mount_info(&self) -> Result<String> {
        Ok(self.mountinfo.clone())
    }

    fn filesystem_health(&self, source: &str) -> Result<String> {
        *self.inspected_source.borrow_mut() = Some(source.to_owned());
        Ok(self.superblock.clone())
    }

    fn invalidate_cache(&self, path: &Path) -> Result<CacheScope> {
        self.invalidations.set(self.invalidations.get() + 1);
        if self.corrupt_reread {
            flip_byte(path, 4096).map_err(|err| QualError::io("inject corruption", err))?;
        }
        Ok(CacheScope::File)
    }

    fn flush(&self) {}

    fn open_block_writer(&self, path: &Path) -> Result<Box<dyn BlockWriter>> {
        let inner = DurableFile::open(path)
            .map_err(|err| QualError::io(format!("open {}", path.display()), err))?;
        match self.fail_write_at {
            Some(fail_at) => Ok(Box::new(FailingWriter {
                inner,
                writes: 0,
                fail_at,
            })),
            None => Ok(Box::new(inner)),
        }
    }
}

/// Fails the `fail_at`-th write (1-based) with an I/O error.
struct FailingWriter {
    inner: DurableFile,
    writes: u64,
    fail_at: u64,
}

impl BlockWriter for FailingWriter {
    fn write_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.writes += 1;
        if self.writes == self.fail_at {
            return Err(io::Error::other("injected media error"));
        }
        self.inner.write_block(offset, data)
    }
}

fn flip_byte(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0_u8; 1];
    file.read_exact(&mut byte)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&[byte[0] ^ 0xFF])?;
    file.sync_all()
}

// -------------------------------------------------------------------------
// Harness
// -------------------------------------------------------------------------

struct Workspace {
    _temp: TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = temp.path().to_path_buf();
        Self { _temp: temp, root }
    }

    fn settings(&self) -> RunSettings {
        RunSettings::default()
            .with_log_dir(self.root.join("log"))
            .with_work_dir(self.root.join("work"))
    }

    fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    fn scratch_entries(&self) -> Vec<String> {
        fs::read_dir(self.work_dir())
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Factory preset shrunk to a few MiB; iteration count stays at 2000.
fn small_factory_plan() -> sdqual_core::TestPlan {
    resolve(
        Preset::Factory,
        &[PlanOverride::SequentialMb(4), PlanOverride::RandomPoolMb(2)],
    )
    .expect("small factory plan resolves")
}

fn run(
    workspace: &Workspace,
    host: &FakeHost,
    plan: sdqual_core::TestPlan,
) -> (sdqual_core::RunOutcome, String) {
    let ctx = RunContext::open(&workspace.settings(), host).expect("context opens");
    let outcome = Orchestrator::new(plan, host, ctx).with_seed(0x55_07).run();
    let log = fs::read_to_string(&outcome.log_path).expect("run log readable");
    (outcome, log)
}

fn last_line(log: &str) -> &str {
    log.lines().last().unwrap_or_default()
}

// -------------------------------------------------------------------------
// Scenarios
// -------------------------------------------------------------------------

#[test]
fn healthy_device_passes() {
    let workspace = Workspace::new();
    let host = FakeHost::healthy(&workspace.root);

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 0, "case=pass_exit log=\n{log}");
    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.verdict.status, VerdictStatus::Pass);
    assert_eq!(outcome.verdict.device_id, "ss07");
    assert!(
        last_line(&log).ends_with(r#"VERDICT {"status":"PASS","device_id":"ss07","exit_code":0}"#),
        "case=verdict_is_last last={}",
        last_line(&log)
    );
    assert_eq!(log.matches("VERDICT ").count(), 1, "case=single_verdict");
    assert!(
        outcome
            .log_path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("sdqual_ss07_") && name.ends_with(".log")),
        "case=log_name path={}",
        outcome.log_path.display()
    );
    assert!(log.contains("cid: 035344534433324780f1c3a5b6014600"));
    assert!(log.contains("random churn progress 2000/2000"), "case=progress");
    assert!(log.contains("eta at 200/2000"), "case=eta_calibration");
    assert!(log.contains("eta at 1500/2000"), "case=eta_refresh");
    assert!(log.contains("sequential integrity OK"));
    assert!(log.contains("fs state=clean"), "case=fs_report");
    assert!(!log.contains("naming convention"), "case=conventional_id");
    assert!(!log.contains("kernel fault"), "case=quiet_kernel_log");
    assert_eq!(host.invalidations.get(), 1);
    assert!(
        workspace.scratch_entries().is_empty(),
        "case=scratch_cleaned entries={:?}",
        workspace.scratch_entries()
    );
    let churn = outcome.churn.expect("churn outcome recorded");
    assert_eq!(churn.iterations, 2000);
    assert_eq!(churn.block_count, 512);
}

#[test]
fn absent_device_exits_2_before_any_write() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.device_present = false;

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 2, "case=device_absent log=\n{log}");
    assert_eq!(
        outcome.state,
        RunState::Failed {
            phase: Phase::Probe,
            exit_code: 2
        }
    );
    assert_eq!(outcome.verdict.failing_phase, Some(Phase::Probe));
    assert!(workspace.scratch_entries().is_empty(), "case=no_scratch_written");
    assert_eq!(host.invalidations.get(), 0);
    assert!(last_line(&log).contains(r#""failing_phase":"probe","exit_code":2"#));
}

#[test]
fn low_space_exits_3() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.free_mb = 100;
    let plan = resolve(Preset::Factory, &[]).expect("factory plan");
    assert_eq!(plan.required_space_mb(), 520);

    let (outcome, log) = run(&workspace, &host, plan);

    assert_eq!(outcome.exit_code(), 3, "case=insufficient_space log=\n{log}");
    assert_eq!(outcome.verdict.failing_phase, Some(Phase::Preflight));
    assert!(log.contains("required 520MB, available 100MB"), "case=space_message");
    assert!(workspace.scratch_entries().is_empty(), "case=no_scratch_written");
}

#[test]
fn corrupted_reread_exits_4_and_keeps_evidence() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.corrupt_reread = true;

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 4, "case=integrity log=\n{log}");
    assert_eq!(outcome.verdict.failing_phase, Some(Phase::Sequential));
    assert!(
        workspace.work_dir().join(SEQUENTIAL_FILE).exists(),
        "case=evidence_retained"
    );
    assert!(!workspace.work_dir().join(POOL_FILE).exists(), "case=churn_skipped");
    assert!(log.contains("sequential integrity mismatch"));
    assert!(log.contains("retaining"), "case=retention_logged");
}

#[test]
fn write_failure_at_417_exits_5() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.fail_write_at = Some(417);

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 5, "case=random_write log=\n{log}");
    assert_eq!(outcome.verdict.failing_phase, Some(Phase::Churn));
    assert!(log.contains("iteration 417"), "case=iteration_recorded");
    assert!(log.contains("random churn progress 250/2000"));
    assert!(!log.contains("random churn progress 500/2000"), "case=no_retry");
    assert!(workspace.scratch_entries().is_empty(), "case=pool_removed");
}

#[test]
fn kernel_faults_are_advisory() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.hostname = "bench-rig".to_owned();
    host.kernel_lines.push(
        "[ 812.004] mmc0: Timeout waiting for hardware cmd interrupt (error -110)".to_owned(),
    );
    host.superblock = "Filesystem state:         not clean\n".to_owned();

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 0, "case=advisory_only log=\n{log}");
    assert!(
        outcome.fault_signals.len() >= 2,
        "case=pre_and_post_signals count={}",
        outcome.fault_signals.len()
    );
    assert!(log.contains("WARN kernel fault"), "case=fault_warned");
    assert!(
        log.contains("spot-check at iteration 250: 1 kernel fault line(s), continuing"),
        "case=spotcheck_warned"
    );
    assert!(
        log.contains("spot-check at iteration 2000"),
        "case=spotcheck_every_250"
    );
    assert!(
        log.contains("random churn progress 2000/2000"),
        "case=churn_ran_to_completion"
    );
    // The fault line stays in the ring buffer, so each of the eight
    // checkpoints reports it once.
    assert_eq!(outcome.spotcheck_signals, 8, "case=spotcheck_total");
    assert_eq!(
        outcome
            .fault_signals
            .iter()
            .filter(|signal| signal.source == ScanSource::Spotcheck)
            .count(),
        8,
        "case=spotcheck_signals_recorded"
    );
    assert!(log.contains("naming convention"), "case=id_warning");
    assert!(log.contains("root filesystem not clean"), "case=dirty_fs_warned");
}

#[test]
fn kernel_mounted_root_is_resolved_to_its_partition() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.mounts = "/dev/root / ext4 rw,noatime 0 0\n".to_owned();
    host.mountinfo = "\
22 28 0:21 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
28 1 179:2 / / rw,noatime shared:1 - ext4 /dev/root rw
29 28 179:1 / /boot/firmware rw,relatime shared:2 - vfat /dev/mmcblk0p1 rw
"
    .to_owned();
    for (partition, number) in [("mmcblk0p1", "179:1"), ("mmcblk0p2", "179:2")] {
        let dir = host.device_dir.join(partition);
        fs::create_dir_all(&dir).expect("partition dir");
        fs::write(dir.join("dev"), format!("{number}\n")).expect("dev attribute");
    }

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 0, "case=pass log=\n{log}");
    assert_eq!(
        host.inspected_source.borrow().as_deref(),
        Some("/dev/mmcblk0p2"),
        "case=superblock_read_from_partition"
    );
    assert!(
        log.contains("root source /dev/root resolved to /dev/mmcblk0p2"),
        "case=resolution_logged"
    );
    assert!(log.contains("fs state=clean"), "case=fs_report");
    assert!(!log.contains("skipping health dump"), "case=not_other_device");
    match outcome.fs_report {
        Some(FsReport::Inspected { device, .. }) => assert_eq!(device, "/dev/mmcblk0p2"),
        other => panic!("expected inspected root, got {other:?}"),
    }
}

#[test]
fn unresolvable_root_source_skips_health_dump() {
    let workspace = Workspace::new();
    let mut host = FakeHost::healthy(&workspace.root);
    host.mounts = "/dev/root / ext4 rw,noatime 0 0\n".to_owned();
    host.mountinfo = "28 1 8:2 / / rw,noatime shared:1 - ext4 /dev/root rw\n".to_owned();

    let (outcome, log) = run(&workspace, &host, small_factory_plan());

    assert_eq!(outcome.exit_code(), 0, "case=advisory_only log=\n{log}");
    assert_eq!(host.inspected_source.borrow().as_deref(), None);
    assert!(log.contains("skipping health dump"), "case=other_device");
}
