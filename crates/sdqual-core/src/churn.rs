//! Randomized in-place write churn.
//!
//! A zero-filled pool file is pre-allocated, then single blocks at uniformly
//! random offsets are overwritten in place with fresh content. Each write is
//! durable before the next iteration starts, which keeps the card's
//! flash-translation layer busy remapping and collecting instead of
//! absorbing the load in its cache. Any failed write ends the phase at once
//! with the iteration number; it is never retried.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use rand::{Rng, RngCore};
use sdqual_error::{QualError, Result};

use crate::context::RunContext;
use crate::estimator::format_duration;
use crate::periodic::{IterationDriver, Tick};
use crate::plan::TestPlan;
use crate::platform::{DurableFile, Platform};

/// Pool file name inside the work directory.
pub const POOL_FILE: &str = "sdqual_pool.bin";

const FILL_CHUNK_BYTES: usize = 1024 * 1024;

/// Summary of a completed churn phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChurnOutcome {
    pub iterations: u64,
    pub block_count: u64,
    pub elapsed: Duration,
}

impl ChurnOutcome {
    #[must_use]
    pub fn iterations_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.iterations as f64 / secs
    }
}

/// Uniform block index in `[0, block_count)`.
///
/// `block_count` must be non-zero; a resolved plan guarantees it.
pub fn pick_block(rng: &mut dyn RngCore, block_count: u64) -> u64 {
    rng.gen_range(0..block_count)
}

/// Run the churn phase described by `plan`, dispatching periodic tasks
/// through `driver` after every iteration.
pub fn run(
    plan: &TestPlan,
    platform: &dyn Platform,
    ctx: &mut RunContext,
    rng: &mut dyn RngCore,
    driver: &mut IterationDriver,
) -> Result<ChurnOutcome> {
    let path = ctx.scratch_path(POOL_FILE);
    let block_count = plan.block_count();
    if block_count == 0 {
        return Err(QualError::Internal("churn pool has no blocks".to_owned()));
    }
    let block_bytes = plan.block_size_bytes();

    ctx.info(format!(
        "random churn: pool {}MB, {block_count} blocks of {}KB, {} iterations",
        plan.random_pool_mb, plan.block_size_kb, plan.random_iterations
    ));
    if let Err(err) = allocate_pool(&path, plan.random_pool_bytes()) {
        let _ = fs::remove_file(&path);
        return Err(err);
    }

    let result = churn_loop(plan, platform, ctx, rng, driver, &path, block_count, block_bytes);

    if let Err(err) = fs::remove_file(&path) {
        ctx.warn(format!("could not remove {}: {err}", path.display()));
    }
    platform.flush();

    let outcome = result?;
    ctx.info(format!(
        "random churn OK: {} iterations in {} ({:.1} it/s)",
        outcome.iterations,
        format_duration(outcome.elapsed),
        outcome.iterations_per_second()
    ));
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn churn_loop(
    plan: &TestPlan,
    platform: &dyn Platform,
    ctx: &mut RunContext,
    rng: &mut dyn RngCore,
    driver: &mut IterationDriver,
    path: &Path,
    block_count: u64,
    block_bytes: usize,
) -> Result<ChurnOutcome> {
    let mut writer = platform.open_block_writer(path)?;
    let mut block = vec![0_u8; block_bytes];
    let total = plan.random_iterations;
    let started = Instant::now();

    for iteration in 1..=total {
        let index = pick_block(rng, block_count);
        rng.fill_bytes(&mut block);
        if let Err(source) = writer.write_block(index * block_bytes as u64, &block) {
            ctx.error(format!(
                "random write failed at iteration {iteration}/{total} (block {index}): {source}"
            ));
            return Err(QualError::RandomWrite { iteration, source });
        }
        let tick = Tick {
            iteration,
            total,
            elapsed: started.elapsed(),
        };
        driver.dispatch(&tick, ctx, platform);
    }

    Ok(ChurnOutcome {
        iterations: total,
        block_count,
        elapsed: started.elapsed(),
    })
}

/// Create the pool file full of zeros, durably.
fn allocate_pool(path: &Path, bytes: u64) -> Result<()> {
    let mut file = DurableFile::create(path)
        .map_err(|err| QualError::io(format!("create {}", path.display()), err))?;
    let zeros = vec![0_u8; FILL_CHUNK_BYTES];
    let mut remaining = bytes;
    while remaining > 0 {
        let len = usize::try_from(remaining).map_or(FILL_CHUNK_BYTES, |r| r.min(FILL_CHUNK_BYTES));
        file.write_all(&zeros[..len])
            .map_err(|err| QualError::io(format!("fill {}", path.display()), err))?;
        remaining -= len as u64;
    }
    file.sync_all()
        .map_err(|err| QualError::io(format!("fsync {}", path.display()), err))
}
