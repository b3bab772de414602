//! Bootstrap coordinator entry point.
//!
//! Arguments before `--` configure the coordinator; everything after is
//! passed through to the managed application, overriding composed defaults.

use std::io::Write;
use std::process::ExitCode;

use tracing::error;

/// Exit code for configuration and telemetry failures.
const CONFIG_FAILURE: u8 = 15;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (own, passthrough) = split_passthrough(&args);

    let loader_args = std::iter::once("corral".to_owned()).chain(own);
    let config = match corral_config::Config::load_from_iter(loader_args) {
        Ok(config) => config,
        Err(load_error) => {
            report_early_failure(&format!("failed to load configuration: {load_error}"));
            return ExitCode::from(CONFIG_FAILURE);
        }
    };
    if let Err(telemetry_error) = corral_boot::telemetry::initialise(&config) {
        report_early_failure(&format!("failed to initialise telemetry: {telemetry_error}"));
        return ExitCode::from(CONFIG_FAILURE);
    }

    match corral_boot::run(&config, &passthrough) {
        Ok(never) => match never {},
        Err(boot_error) => {
            error!(
                error = %boot_error,
                exit_code = boot_error.exit_code(),
                "boot sequence failed"
            );
            ExitCode::from(boot_error.exit_code())
        }
    }
}

/// Splits the argument list at the first `--`.
fn split_passthrough(args: &[String]) -> (Vec<String>, Vec<String>) {
    match args.iter().position(|arg| arg == "--") {
        Some(at) => {
            let (own, rest) = args.split_at(at);
            let passthrough = rest.get(1..).unwrap_or_default();
            (own.to_vec(), passthrough.to_vec())
        }
        None => (args.to_vec(), Vec::new()),
    }
}

/// Telemetry is not up yet on these paths; write straight to stderr.
fn report_early_failure(message: &str) {
    let mut stderr = std::io::stderr().lock();
    drop(writeln!(stderr, "corral: {message}"));
}
