use std::env;
use std::process::ExitCode;

use sdqual_core::context::device_id_from_hostname;
use sdqual_core::{LinuxPlatform, Orchestrator, Platform, RunContext, Verdict, resolve};
use sdqual_error::QualError;
use tracing_subscriber::EnvFilter;

mod args;

use args::{CliCommand, HELP, parse_args};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn fail_early(err: &QualError) -> ExitCode {
    eprintln!("sdqual: {err}");
    eprintln!("run `sdqual --help` for usage");
    ExitCode::from(err.exit_code())
}

fn main() -> ExitCode {
    let argv: Vec<String> = env::args().skip(1).collect();
    let config = match parse_args(&argv) {
        Ok(CliCommand::Help) => {
            println!("{HELP}");
            return ExitCode::SUCCESS;
        }
        Ok(CliCommand::Run(config)) => config,
        Err(err) => return fail_early(&err),
    };
    // Plan errors are usage errors: report them before any log file exists.
    let plan = match resolve(config.preset, &config.overrides) {
        Ok(plan) => plan,
        Err(err) => return fail_early(&err),
    };

    init_tracing();
    tracing::info!(preset = %config.preset, plan = %plan, "resolved test plan");

    let platform = LinuxPlatform::new(&config.settings);
    let ctx = match RunContext::open(&config.settings, &platform) {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::error!(error = %err, "could not start run");
            // No run log exists, so stdout is the only place for the verdict.
            let device_id = platform
                .hostname()
                .map_or_else(|_| "unknown".to_owned(), |name| device_id_from_hostname(&name));
            println!("{}", Verdict::aborted(&device_id, err.exit_code()).line());
            return ExitCode::from(err.exit_code());
        }
    };

    let outcome = Orchestrator::new(plan, &platform, ctx).run();
    println!("{}", outcome.verdict.line());
    eprintln!("run log: {}", outcome.log_path.display());
    ExitCode::from(outcome.exit_code())
}
