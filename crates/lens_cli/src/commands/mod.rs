//! CLI command definitions.
//!
//! Each subcommand maps to one supervisor operation. Global flags override
//! the configuration file and fall back to `LOGICLENS_*` environment
//! variables.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lens_core::{RuntimeConfig, TracingSink};
use lens_supervisor::{operations, SupervisorError, SupervisorResult, Toolkit};

pub mod ollama;
pub mod setup;
pub mod start;
pub mod status;
pub mod stop;

/// LogicLens - local service lifecycle supervisor
#[derive(Parser)]
#[command(name = "logiclens")]
#[command(version, about = "LogicLens - local service lifecycle supervisor")]
#[command(long_about = r#"
LogicLens provisions the backend environment, frees the service port,
verifies the local Ollama server, and supervises the Flask backend. Failures
are classified into coded errors and recovered automatically where possible.

COMMANDS:
  start   → Provision, resolve conflicts, verify Ollama, launch and supervise
  stop    → Stop running instances and free the port
  setup   → Create the virtual environment, install dependencies, write .env
  test    → Generate sample data through the virtual environment
  status  → Show port, process and environment state
  ollama  → Show, list, verify or configure the Ollama integration

EXIT CODES:
  0   - Success
  1   - Unrecoverable failure
  130 - Interrupted by the user
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (defaults to ./logiclens.toml when present)
    #[arg(long, global = true, env = "LOGICLENS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host to bind the server to
    #[arg(long, global = true, env = "LOGICLENS_HOST")]
    pub host: Option<String>,

    /// Port to bind the server to
    #[arg(long, global = true, env = "LOGICLENS_PORT")]
    pub port: Option<u16>,

    /// Run the server without debug mode
    #[arg(long, global = true)]
    pub no_debug: bool,

    /// Ollama server URL
    #[arg(long, global = true, env = "LOGICLENS_OLLAMA_HOST")]
    pub ollama_host: Option<String>,

    /// Ollama model to use
    #[arg(long, global = true, env = "LOGICLENS_OLLAMA_MODEL")]
    pub ollama_model: Option<String>,
}

impl GlobalArgs {
    /// Load the configuration and apply the command-line overrides.
    pub fn load_config(&self) -> Result<RuntimeConfig> {
        let cwd = std::env::current_dir()?;
        let config = RuntimeConfig::discover(self.config.as_deref(), &cwd)
            .context("Failed to load configuration")?;
        Ok(self.apply(config))
    }

    fn apply(&self, mut config: RuntimeConfig) -> RuntimeConfig {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_debug {
            config.debug = false;
        }
        if let Some(host) = &self.ollama_host {
            config.ollama.host = host.clone();
        }
        if let Some(model) = &self.ollama_model {
            config.ollama.model = model.clone();
        }
        config
    }

    /// Whether an Ollama setting was given on the command line.
    pub fn changes_ollama(&self) -> bool {
        self.ollama_host.is_some() || self.ollama_model.is_some()
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the application and supervise it until interrupted
    Start,

    /// Stop running instances of the application
    Stop,

    /// Set up the environment without starting the server
    Setup,

    /// Generate sample data
    Test,

    /// Show the application status
    Status,

    /// Manage the Ollama integration
    Ollama(ollama::OllamaArgs),
}

/// Configuration plus the services commands run against.
pub struct Session {
    pub config: RuntimeConfig,
    pub toolkit: Toolkit,
}

impl Session {
    pub fn open(global: &GlobalArgs) -> Result<Self> {
        let config = global.load_config()?;
        let toolkit = Toolkit::system(&config, Arc::new(TracingSink));
        Ok(Self { config, toolkit })
    }

    /// Turn a supervisor result into a command result, trying recovery for
    /// errors that were not handled yet.
    pub async fn finish<T>(&self, command: &str, result: SupervisorResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                operations::recover_command(&self.toolkit, &self.config, command, &e).await;
                Err(e.into())
            }
        }
    }
}

/// Run `command`, aborting with [`SupervisorError::Interrupted`] on Ctrl+C.
pub async fn interruptible<F>(command: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = command => result,
        _ = tokio::signal::ctrl_c() => Err(SupervisorError::Interrupted.into()),
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "logiclens",
            "start",
            "--host",
            "127.0.0.1",
            "--port",
            "6000",
            "--no-debug",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Start));

        let config = cli.global.apply(RuntimeConfig::default());
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6000);
        assert!(!config.debug);
        assert_eq!(config.ollama.model, "llama2");
    }

    #[test]
    fn test_ollama_flags() {
        let cli = Cli::try_parse_from([
            "logiclens",
            "ollama",
            "--verify",
            "--ollama-model",
            "mistral",
        ])
        .unwrap();
        let Commands::Ollama(args) = cli.command else {
            panic!("expected the ollama command");
        };
        assert!(args.verify);
        assert!(!args.list_models);
        assert!(cli.global.changes_ollama());
        assert_eq!(
            cli.global.apply(RuntimeConfig::default()).ollama.model,
            "mistral"
        );
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!(Cli::try_parse_from(["logiclens", "start", "--port", "70000"]).is_err());
    }
}
