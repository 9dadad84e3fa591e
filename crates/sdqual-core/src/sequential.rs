//! Sequential write / invalidate / re-read integrity check.
//!
//! The payload digest is accumulated from the exact buffers handed to the
//! durable writes. After the file is flushed and evicted from every cache
//! the platform can reach, it is read back from the medium and digested
//! again. A difference is the strongest corruption signal the tool has, and
//! the scratch file is left in place as evidence.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use rand::RngCore;
use sdqual_error::{QualError, Result};
use sha2::{Digest, Sha256};

use crate::context::RunContext;
use crate::plan::TestPlan;
use crate::platform::{CacheScope, DurableFile, Platform};

/// Scratch file name inside the work directory.
pub const SEQUENTIAL_FILE: &str = "sdqual_seq.bin";

const CHUNK_BYTES: usize = 1024 * 1024;

/// Evidence from a passing sequential check.
#[derive(Debug, Clone, PartialEq)]
pub struct SequentialOutcome {
    pub digest: String,
    pub bytes: u64,
    pub write_mib_per_sec: f64,
    pub read_mib_per_sec: f64,
    pub cache_scope: CacheScope,
}

/// Run the check described by `plan.sequential_mb`.
pub fn run(
    plan: &TestPlan,
    platform: &dyn Platform,
    ctx: &mut RunContext,
    rng: &mut dyn RngCore,
) -> Result<SequentialOutcome> {
    let path = ctx.scratch_path(SEQUENTIAL_FILE);
    let bytes = plan.sequential_bytes();
    ctx.info(format!(
        "sequential write {}MB to {} (O_DSYNC)",
        plan.sequential_mb,
        path.display()
    ));

    let write_started = Instant::now();
    let written = match write_payload(&path, bytes, rng) {
        Ok(digest) => digest,
        Err(err) => {
            let _ = fs::remove_file(&path);
            return Err(err);
        }
    };
    let write_elapsed = write_started.elapsed();
    ctx.info(format!(
        "sequential write done: sha256={written} ({:.1} MiB/s)",
        mib_per_sec(bytes, write_elapsed)
    ));

    let cache_scope = platform.invalidate_cache(&path)?;
    match cache_scope {
        CacheScope::Global => ctx.info("caches flushed and dropped (file + global)"),
        CacheScope::File => ctx.warn(
            "global drop_caches unavailable; file pages evicted with fadvise(DONTNEED) only",
        ),
    }

    let read_started = Instant::now();
    let reread = digest_file(&path)?;
    let read_elapsed = read_started.elapsed();
    ctx.info(format!(
        "sequential re-read: sha256={reread} ({:.1} MiB/s)",
        mib_per_sec(bytes, read_elapsed)
    ));

    if written != reread {
        ctx.error(format!(
            "sequential integrity mismatch: written={written} reread={reread}; keeping {} for inspection",
            path.display()
        ));
        return Err(QualError::SequentialIntegrity {
            written,
            reread,
            scratch: path,
        });
    }

    fs::remove_file(&path)
        .map_err(|err| QualError::io(format!("remove {}", path.display()), err))?;
    platform.flush();
    ctx.info("sequential integrity OK");

    Ok(SequentialOutcome {
        digest: written,
        bytes,
        write_mib_per_sec: mib_per_sec(bytes, write_elapsed),
        read_mib_per_sec: mib_per_sec(bytes, read_elapsed),
        cache_scope,
    })
}

/// Write `bytes` of random payload durably and return its SHA-256.
fn write_payload(path: &Path, bytes: u64, rng: &mut dyn RngCore) -> Result<String> {
    let mut file = DurableFile::create(path)
        .map_err(|err| QualError::io(format!("create {}", path.display()), err))?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0_u8; CHUNK_BYTES];
    let mut remaining = bytes;
    while remaining > 0 {
        let len = usize::try_from(remaining).map_or(CHUNK_BYTES, |r| r.min(CHUNK_BYTES));
        let buf = &mut chunk[..len];
        rng.fill_bytes(buf);
        hasher.update(&*buf);
        file.write_all(buf)
            .map_err(|err| QualError::io(format!("write {}", path.display()), err))?;
        remaining -= len as u64;
    }
    file.sync_all()
        .map_err(|err| QualError::io(format!("fsync {}", path.display()), err))?;
    Ok(hex(&hasher.finalize()))
}

/// SHA-256 of a file's current contents as read from disk.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).map_err(|err| QualError::io(format!("open {}", path.display()), err))?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0_u8; CHUNK_BYTES];
    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|err| QualError::io(format!("read {}", path.display()), err))?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0F)]));
    }
    out
}

fn mib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / secs
}
