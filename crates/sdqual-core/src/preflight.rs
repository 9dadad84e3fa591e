//! Free-space check performed before anything is written.

use sdqual_error::{QualError, Result};

use crate::context::RunContext;
use crate::plan::TestPlan;
use crate::platform::Platform;

/// Outcome of a passing space check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceCheck {
    pub required_mb: u64,
    pub available_mb: u64,
}

/// Compare available against required space. Equality passes.
pub fn evaluate(required_mb: u64, available_mb: u64) -> Result<SpaceCheck> {
    if available_mb < required_mb {
        return Err(QualError::InsufficientSpace {
            required_mb,
            available_mb,
        });
    }
    Ok(SpaceCheck {
        required_mb,
        available_mb,
    })
}

/// Measure free space on the scratch filesystem and check it against the
/// plan's requirement.
pub fn check_capacity(
    plan: &TestPlan,
    platform: &dyn Platform,
    ctx: &mut RunContext,
) -> Result<SpaceCheck> {
    let required_mb = plan.required_space_mb();
    let available_mb = platform.available_space_mb(ctx.work_dir())?;
    ctx.info(format!(
        "space check: required={required_mb}MB (seq {} + pool {} + margin) available={available_mb}MB",
        plan.sequential_mb, plan.random_pool_mb
    ));
    evaluate(required_mb, available_mb)
}
