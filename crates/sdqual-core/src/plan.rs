//! Test-plan presets and override resolution.
//!
//! A run starts from one of three named presets and applies zero or more
//! single-field overrides in argument order (last write wins). The result is
//! validated once and never changes afterwards.

use std::fmt;
use std::str::FromStr;

use sdqual_error::{QualError, Result};
use serde::Serialize;

/// Scratch headroom kept free on top of the plan's own files.
pub const SAFETY_MARGIN_MB: u64 = 200;

/// Named bundle of plan defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Short smoke pass for bench checks.
    Quick,
    /// Standard pre-deployment pass.
    #[default]
    Factory,
    /// Extended soak for suspect cards.
    Burnin,
}

impl Preset {
    pub const ALL: [Self; 3] = [Self::Quick, Self::Factory, Self::Burnin];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Factory => "factory",
            Self::Burnin => "burnin",
        }
    }

    /// Canonical defaults for this preset.
    #[must_use]
    pub const fn plan(self) -> TestPlan {
        match self {
            Self::Quick => TestPlan {
                sequential_mb: 128,
                random_pool_mb: 32,
                random_iterations: 800,
                block_size_kb: 4,
            },
            Self::Factory => TestPlan {
                sequential_mb: 256,
                random_pool_mb: 64,
                random_iterations: 2000,
                block_size_kb: 4,
            },
            Self::Burnin => TestPlan {
                sequential_mb: 1024,
                random_pool_mb: 256,
                random_iterations: 12000,
                block_size_kb: 4,
            },
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = QualError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                QualError::usage(format!(
                    "unknown preset `{s}` (expected quick|factory|burnin)"
                ))
            })
    }
}

/// One field override applied on top of a preset.
///
/// Values are signed so that a non-positive request surfaces as a
/// configuration error instead of being lost to integer parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOverride {
    SequentialMb(i64),
    RandomPoolMb(i64),
    RandomIterations(i64),
    BlockSizeKb(i64),
}

impl PlanOverride {
    const fn field(self) -> &'static str {
        match self {
            Self::SequentialMb(_) => "sequential_mb",
            Self::RandomPoolMb(_) => "random_pool_mb",
            Self::RandomIterations(_) => "random_iterations",
            Self::BlockSizeKb(_) => "block_size_kb",
        }
    }

    const fn value(self) -> i64 {
        match self {
            Self::SequentialMb(v)
            | Self::RandomPoolMb(v)
            | Self::RandomIterations(v)
            | Self::BlockSizeKb(v) => v,
        }
    }
}

/// Concrete numeric parameters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestPlan {
    pub sequential_mb: u64,
    pub random_pool_mb: u64,
    pub random_iterations: u64,
    pub block_size_kb: u64,
}

impl TestPlan {
    /// Number of addressable blocks in the churn pool.
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.random_pool_mb * 1024 / self.block_size_kb
    }

    #[must_use]
    pub const fn block_size_bytes(&self) -> usize {
        (self.block_size_kb * 1024) as usize
    }

    #[must_use]
    pub const fn sequential_bytes(&self) -> u64 {
        self.sequential_mb * 1024 * 1024
    }

    #[must_use]
    pub const fn random_pool_bytes(&self) -> u64 {
        self.random_pool_mb * 1024 * 1024
    }

    /// Scratch space the run needs, safety margin included.
    #[must_use]
    pub const fn required_space_mb(&self) -> u64 {
        self.sequential_mb + self.random_pool_mb + SAFETY_MARGIN_MB
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("sequential_mb", self.sequential_mb),
            ("random_pool_mb", self.random_pool_mb),
            ("random_iterations", self.random_iterations),
            ("block_size_kb", self.block_size_kb),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(QualError::config(format!("{name} must be positive")));
        }
        let pool_kb = self
            .random_pool_mb
            .checked_mul(1024)
            .ok_or_else(|| QualError::config("random_pool_mb is too large"))?;
        if pool_kb % self.block_size_kb != 0 {
            return Err(QualError::config(format!(
                "block_size_kb={} does not divide random pool of {pool_kb}KB",
                self.block_size_kb
            )));
        }
        if self.block_size_kb > usize::MAX as u64 / 1024 {
            return Err(QualError::config("block_size_kb is too large"));
        }
        if self.sequential_mb.checked_mul(1024 * 1024).is_none()
            || pool_kb.checked_mul(1024).is_none()
            || self
                .sequential_mb
                .checked_add(self.random_pool_mb)
                .and_then(|sum| sum.checked_add(SAFETY_MARGIN_MB))
                .is_none()
        {
            return Err(QualError::config("plan sizes overflow"));
        }
        Ok(())
    }
}

impl fmt::Display for TestPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={}MB pool={}MB iters={} block={}KB",
            self.sequential_mb, self.random_pool_mb, self.random_iterations, self.block_size_kb
        )
    }
}

/// Resolve a preset plus ordered overrides into a validated plan.
pub fn resolve(preset: Preset, overrides: &[PlanOverride]) -> Result<TestPlan> {
    let mut plan = preset.plan();
    for item in overrides {
        let value = u64::try_from(item.value())
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| {
                QualError::config(format!(
                    "{} must be positive, got {}",
                    item.field(),
                    item.value()
                ))
            })?;
        match item {
            PlanOverride::SequentialMb(_) => plan.sequential_mb = value,
            PlanOverride::RandomPoolMb(_) => plan.random_pool_mb = value,
            PlanOverride::RandomIterations(_) => plan.random_iterations = value,
            PlanOverride::BlockSizeKb(_) => plan.block_size_kb = value,
        }
    }
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn presets_match_table() {
        assert_eq!(
            resolve(Preset::Quick, &[]).unwrap(),
            TestPlan {
                sequential_mb: 128,
                random_pool_mb: 32,
                random_iterations: 800,
                block_size_kb: 4,
            }
        );
        assert_eq!(Preset::default(), Preset::Factory);
        let factory = resolve(Preset::Factory, &[]).unwrap();
        assert_eq!(factory.required_space_mb(), 520, "case=factory_required");
        assert_eq!(factory.block_count(), 16_384, "case=factory_blocks");
        let burnin = resolve(Preset::Burnin, &[]).unwrap();
        assert_eq!(burnin.random_iterations, 12_000);
        assert_eq!(burnin.sequential_mb, 1024);
    }

    #[test]
    fn overrides_apply_in_order_last_wins() {
        let plan = resolve(
            Preset::Quick,
            &[
                PlanOverride::SequentialMb(10),
                PlanOverride::RandomIterations(5),
                PlanOverride::SequentialMb(20),
            ],
        )
        .unwrap();
        assert_eq!(plan.sequential_mb, 20, "case=last_write_wins");
        assert_eq!(plan.random_iterations, 5);
        assert_eq!(plan.random_pool_mb, 32, "case=untouched_field");
    }

    #[test]
    fn non_positive_override_is_configuration_error() {
        for bad in [
            PlanOverride::SequentialMb(0),
            PlanOverride::RandomPoolMb(-1),
            PlanOverride::RandomIterations(0),
            PlanOverride::BlockSizeKb(-4),
        ] {
            let err = resolve(Preset::Factory, &[bad]).unwrap_err();
            assert!(
                matches!(err, QualError::Configuration(_)),
                "case=non_positive override={bad:?} err={err}"
            );
        }
    }

    #[test]
    fn non_dividing_block_size_is_rejected() {
        let err = resolve(Preset::Factory, &[PlanOverride::BlockSizeKb(3)]).unwrap_err();
        assert!(matches!(err, QualError::Configuration(_)), "err={err}");
        let ok = resolve(Preset::Factory, &[PlanOverride::BlockSizeKb(64)]).unwrap();
        assert_eq!(ok.block_count(), 1024);
    }

    #[test]
    fn preset_parses_case_insensitively() {
        assert_eq!("BurnIn".parse::<Preset>().unwrap(), Preset::Burnin);
        assert!("slow".parse::<Preset>().is_err());
    }

    proptest! {
        #[test]
        fn resolver_never_panics_and_plans_are_positive(
            seq in -8_i64..4096,
            pool in -8_i64..1024,
            iters in -8_i64..100_000,
            block in -8_i64..512,
        ) {
            let result = resolve(
                Preset::Factory,
                &[
                    PlanOverride::SequentialMb(seq),
                    PlanOverride::RandomPoolMb(pool),
                    PlanOverride::RandomIterations(iters),
                    PlanOverride::BlockSizeKb(block),
                ],
            );
            let valid = seq > 0 && pool > 0 && iters > 0 && block > 0 && (pool * 1024) % block == 0;
            match result {
                Ok(plan) => {
                    prop_assert!(valid);
                    prop_assert!(plan.sequential_mb > 0 && plan.random_pool_mb > 0);
                    prop_assert!(plan.random_iterations > 0 && plan.block_size_kb > 0);
                    prop_assert_eq!(plan.block_count() * plan.block_size_kb, plan.random_pool_mb * 1024);
                }
                Err(err) => {
                    prop_assert!(!valid);
                    prop_assert!(matches!(err, QualError::Configuration(_)));
                }
            }
        }
    }
}
