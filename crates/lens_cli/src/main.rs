//! LogicLens supervisor CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Unrecoverable failure
//! - 130: Interrupted by the user

use std::process::ExitCode;

use clap::Parser;
use lens_supervisor::SupervisorError;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// Process exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const INTERRUPTED: u8 = 130;
}

const DEFAULT_FILTER: &str = "logiclens=info,warn";
const VERBOSE_FILTER: &str =
    "logiclens=debug,lens_core=debug,lens_runner=debug,lens_supervisor=debug,lens_cli=debug,info";

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    });

    // Ignore a second initialization
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Start => commands::start::execute(&cli.global).await,
        Commands::Stop => commands::interruptible(commands::stop::execute(&cli.global)).await,
        Commands::Setup => commands::interruptible(commands::setup::execute(&cli.global)).await,
        Commands::Test => commands::interruptible(commands::test::execute(&cli.global)).await,
        Commands::Status => commands::interruptible(commands::status::execute(&cli.global)).await,
        Commands::Ollama(args) => {
            commands::interruptible(commands::ollama::execute(args, &cli.global)).await
        }
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let code = exit_code_for(&e);
            if code == ExitCodes::INTERRUPTED {
                error!(target: "logiclens", "Operation interrupted by user");
            } else {
                error!(target: "logiclens", "{:#}", e);
            }
            ExitCode::from(code)
        }
    }
}

/// Map a command error to the process exit code.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<SupervisorError>() {
        Some(SupervisorError::Interrupted) => ExitCodes::INTERRUPTED,
        _ => ExitCodes::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_maps_to_130() {
        let err = anyhow::Error::from(SupervisorError::Interrupted);
        assert_eq!(exit_code_for(&err), 130);

        let err = anyhow::Error::from(SupervisorError::PortStillInUse(5050));
        assert_eq!(exit_code_for(&err), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }
}
