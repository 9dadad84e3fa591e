//! Command-line parsing for `sdqual`.

use sdqual_core::{PlanOverride, Preset, RunSettings};
use sdqual_error::{QualError, Result};

pub const HELP: &str = "\
sdqual - microSD quality verification

USAGE:
    sdqual [PRESET] [OPTIONS]

PRESETS (mutually exclusive, default factory):
    --quick,   quick          128MB sequential, 32MB pool, 800 iterations
    --factory, factory        256MB sequential, 64MB pool, 2000 iterations
    --burnin,  burnin         1024MB sequential, 256MB pool, 12000 iterations

OVERRIDES:
    --seq-mb <N>              Sequential payload size in MB
    --rand-mb <N>             Random churn pool size in MB
    --rand-iters <N>          Random churn iterations
    --block-kb <N>            Churn block size in KB (must divide the pool)

LOCATIONS:
    --log-dir <PATH>          Run log directory (default /var/log/sdqual)
    --work-dir <PATH>         Scratch directory on the card (default /var/tmp/sdqual)
    --device <NAME>           Primary block device (default mmcblk0)

    -h, --help                Show this help

EXIT CODES:
    0 pass, 1 usage, configuration or I/O error outside the churn loop,
    2 device not found, 3 insufficient space,
    4 sequential integrity mismatch, 5 random write failure
";

/// A fully parsed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    pub preset: Preset,
    pub overrides: Vec<PlanOverride>,
    pub settings: RunSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Help,
    Run(CliConfig),
}

pub fn parse_args(args: &[String]) -> Result<CliCommand> {
    let mut preset: Option<Preset> = None;
    let mut overrides = Vec::new();
    let mut settings = RunSettings::default();

    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        match arg {
            "-h" | "--help" => return Ok(CliCommand::Help),
            "--quick" | "--factory" | "--burnin" | "quick" | "factory" | "burnin" => {
                let chosen: Preset = arg.trim_start_matches("--").parse()?;
                match preset {
                    Some(existing) if existing != chosen => {
                        return Err(QualError::usage(format!(
                            "presets are mutually exclusive: {existing} and {chosen}"
                        )));
                    }
                    _ => preset = Some(chosen),
                }
            }
            "--seq-mb" => overrides.push(PlanOverride::SequentialMb(int_value(args, &mut index)?)),
            "--rand-mb" => overrides.push(PlanOverride::RandomPoolMb(int_value(args, &mut index)?)),
            "--rand-iters" => {
                overrides.push(PlanOverride::RandomIterations(int_value(args, &mut index)?));
            }
            "--block-kb" => overrides.push(PlanOverride::BlockSizeKb(int_value(args, &mut index)?)),
            "--log-dir" => settings = settings.with_log_dir(value(args, &mut index)?),
            "--work-dir" => settings = settings.with_work_dir(value(args, &mut index)?),
            "--device" => settings = settings.with_device(value(args, &mut index)?),
            unknown => return Err(QualError::usage(format!("unknown option: {unknown}"))),
        }
        index += 1;
    }

    Ok(CliCommand::Run(CliConfig {
        preset: preset.unwrap_or_default(),
        overrides,
        settings,
    }))
}

/// Consume the value following the flag at `index`.
fn value<'a>(args: &'a [String], index: &mut usize) -> Result<&'a str> {
    let flag = &args[*index];
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| QualError::usage(format!("{flag} requires a value")))
}

fn int_value(args: &[String], index: &mut usize) -> Result<i64> {
    let flag = args[*index].clone();
    let raw = value(args, index)?;
    raw.parse::<i64>()
        .map_err(|_| QualError::usage(format!("invalid {flag} value: {raw} (expected an integer)")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn argv(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| (*arg).to_owned()).collect()
    }

    fn config(raw: &[&str]) -> CliConfig {
        match parse_args(&argv(raw)).expect("arguments should parse") {
            CliCommand::Run(config) => config,
            CliCommand::Help => panic!("unexpected help for {raw:?}"),
        }
    }

    #[test]
    fn defaults_to_factory_without_overrides() {
        let config = config(&[]);
        assert_eq!(config.preset, Preset::Factory);
        assert!(config.overrides.is_empty());
        assert_eq!(config.settings, RunSettings::default());
    }

    #[test]
    fn flag_and_bare_word_presets() {
        assert_eq!(config(&["--quick"]).preset, Preset::Quick, "case=flag");
        assert_eq!(config(&["burnin"]).preset, Preset::Burnin, "case=bare_word");
        assert_eq!(
            config(&["--burnin", "burnin"]).preset,
            Preset::Burnin,
            "case=same_preset_repeated"
        );
    }

    #[test]
    fn conflicting_presets_are_rejected() {
        let err = parse_args(&argv(&["--quick", "--burnin"])).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("mutually exclusive"), "err={err}");
    }

    #[test]
    fn overrides_keep_argument_order() {
        let config = config(&["--seq-mb", "64", "--block-kb", "8", "--seq-mb", "32"]);
        assert_eq!(
            config.overrides,
            vec![
                PlanOverride::SequentialMb(64),
                PlanOverride::BlockSizeKb(8),
                PlanOverride::SequentialMb(32),
            ]
        );
    }

    #[test]
    fn negative_override_parses_for_later_rejection() {
        let config = config(&["--rand-iters", "-5"]);
        assert_eq!(config.overrides, vec![PlanOverride::RandomIterations(-5)]);
    }

    #[test]
    fn locations_are_applied() {
        let config = config(&["--log-dir", "/tmp/l", "--work-dir", "/tmp/w", "--device", "sda"]);
        assert_eq!(config.settings.log_dir, PathBuf::from("/tmp/l"));
        assert_eq!(config.settings.work_dir, PathBuf::from("/tmp/w"));
        assert_eq!(config.settings.device, "sda");
    }

    #[test]
    fn usage_errors() {
        let cases: [&[&str]; 4] = [
            &["--bogus"],
            &["--seq-mb"],
            &["--seq-mb", "lots"],
            &["--block-kb", "4.5"],
        ];
        for raw in cases {
            let err = parse_args(&argv(raw)).unwrap_err();
            assert_eq!(err.exit_code(), 1, "case=usage args={raw:?}");
        }
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(
            parse_args(&argv(&["--seq-mb", "4", "-h", "--bogus"])).expect("help"),
            CliCommand::Help
        );
    }
}
