use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use stackup_core::{exit_code_for, ExitCode};
use tracing::error;

mod command_flows;
mod dispatch;
mod logging;
mod orchestrator;
mod render;

#[cfg(test)]
mod tests;

use dispatch::{run_cli, Cli};
use logging::init_logging;

fn main() -> process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return exit_for_parse_error(&err),
    };

    if let Err(err) = init_logging(cli.log_format) {
        eprintln!("error: {err:#}");
        return to_process_exit(ExitCode::Failure);
    }

    match run_cli(cli) {
        Ok(code) => to_process_exit(code),
        Err(err) => {
            let code = exit_code_for(&err);
            error!(exit_code = code.code(), "{err:#}");
            eprintln!("error: {err:#}");
            to_process_exit(code)
        }
    }
}

/// Usage errors are validation failures (3); clap's own exit code 2 would
/// collide with the no-op signal.
fn exit_for_parse_error(err: &clap::Error) -> process::ExitCode {
    let _ = err.print();
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => to_process_exit(ExitCode::Success),
        _ => to_process_exit(ExitCode::Validation),
    }
}

fn to_process_exit(code: ExitCode) -> process::ExitCode {
    process::ExitCode::from(code.code() as u8)
}
