//! The individual steps a supervisor run is made of.
//!
//! Each step either completes or returns a [`StepFailure`]: the error plus
//! the context string the classifier and the recovery ledger key on. Steps
//! never recover on their own; that is the orchestrator's job.

use std::fmt;
use std::path::PathBuf;

use lens_core::{EnvironmentProbe as _, ErrorCode, Failure, RuntimeConfig, StepError};
use lens_runner::{ChildHandle, CommandSpec};
use tracing::debug;

use crate::operations;
use crate::toolkit::Toolkit;

/// File in the backend directory run by the `test` command when no seed
/// script is configured.
pub const SEED_SCRIPT_FILE: &str = "generate_test_data.py";

/// A unit of work the orchestrator runs and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Backend check, isolated environment, dependencies and `.env`.
    Provision,
    /// Backend check and isolated environment only.
    PrepareInterpreter,
    /// Stop stale instances and make sure the port is free.
    ResolveConflicts,
    VerifyExternalService,
    Launch,
    SeedSampleData,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provision => "provision environment",
            Self::PrepareInterpreter => "prepare interpreter",
            Self::ResolveConflicts => "resolve port conflicts",
            Self::VerifyExternalService => "verify Ollama",
            Self::Launch => "launch server",
            Self::SeedSampleData => "seed sample data",
        };
        f.write_str(name)
    }
}

/// A failed step and the context it failed in.
#[derive(Debug)]
pub struct StepFailure {
    pub context: String,
    pub error: StepError,
}

impl StepFailure {
    pub fn new(context: impl Into<String>, error: impl Into<StepError>) -> Self {
        Self {
            context: context.into(),
            error: error.into(),
        }
    }
}

/// Attach a context string to a step result.
pub trait StepContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T, StepFailure>;
}

impl<T, E: Into<StepError>> StepContext<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, StepFailure> {
        self.map_err(|e| StepFailure::new(context, e))
    }
}

/// Slot holding the server process once `Launch` has spawned it.
pub type ServerSlot = Option<Box<dyn ChildHandle>>;

/// Run `step` once. `Launch` stores the server in `server` as soon as it is
/// spawned, so the caller can stop it even if the step is abandoned.
pub async fn execute(
    step: Step,
    toolkit: &Toolkit,
    config: &RuntimeConfig,
    server: &mut ServerSlot,
) -> Result<(), StepFailure> {
    match step {
        Step::Provision => provision(toolkit, config).await,
        Step::PrepareInterpreter => prepare_interpreter(toolkit, config).await,
        Step::ResolveConflicts => resolve_conflicts(toolkit, config).await,
        Step::VerifyExternalService => toolkit
            .verifier
            .verify(config)
            .await
            .context("Checking ollama server"),
        Step::Launch => launch(toolkit, config, server).await,
        Step::SeedSampleData => seed_sample_data(toolkit, config).await,
    }
}

async fn prepare_interpreter(toolkit: &Toolkit, config: &RuntimeConfig) -> Result<(), StepFailure> {
    toolkit
        .provisioner
        .check_backend(config)
        .context("Checking backend directory")?;
    toolkit
        .provisioner
        .ensure_environment(config)
        .await
        .context("Creating virtual environment")?;
    Ok(())
}

async fn provision(toolkit: &Toolkit, config: &RuntimeConfig) -> Result<(), StepFailure> {
    prepare_interpreter(toolkit, config).await?;
    toolkit
        .provisioner
        .install_dependencies(config)
        .await
        .context("Installing dependencies")?;
    toolkit
        .provisioner
        .materialize_config(config)
        .context("Creating .env file")?;
    Ok(())
}

async fn resolve_conflicts(toolkit: &Toolkit, config: &RuntimeConfig) -> Result<(), StepFailure> {
    operations::terminate_instances(toolkit, config).await;

    if toolkit.resolver.is_port_in_use(config.port).await {
        return Err(StepFailure::new(
            "Checking port availability",
            Failure::os(format!("Port {} is already in use", config.port)),
        ));
    }
    debug!("Port {} is free", config.port);
    Ok(())
}

/// The server command line for the current configuration.
pub fn server_command(config: &RuntimeConfig) -> CommandSpec {
    let (env, debug) = if config.debug {
        ("development", "1")
    } else {
        ("production", "0")
    };
    CommandSpec::new(config.venv_python())
        .args(["-m", "flask", "run", "--host"])
        .arg(&config.host)
        .arg("--port")
        .arg(config.port.to_string())
        .cwd(config.backend_path())
        .env("FLASK_APP", &config.service.app_module)
        .env("FLASK_ENV", env)
        .env("FLASK_DEBUG", debug)
}

async fn launch(toolkit: &Toolkit, config: &RuntimeConfig, server: &mut ServerSlot) -> Result<(), StepFailure> {
    let context = format!("Starting {} server", config.service.name);
    toolkit.sink.info(&format!(
        "Starting Flask on {}:{} with debug={}",
        config.host, config.port, config.debug
    ));

    let child = server.insert(
        toolkit
            .runner
            .spawn(&server_command(config))
            .await
            .context(context.as_str())?,
    );

    tokio::time::sleep(config.timeouts.launch_settle()).await;

    match child.try_wait().context(context.as_str())? {
        None => Ok(()),
        Some(exit) => {
            *server = None;
            Err(StepFailure::new(
                context,
                Failure::subprocess(format!("Flask process terminated unexpectedly with {}", exit)),
            ))
        }
    }
}

/// Command that seeds sample data, if the backend provides a generator.
pub fn seed_command(config: &RuntimeConfig) -> Option<CommandSpec> {
    let python = config.venv_python();
    let backend = config.backend_path();
    let spec = match &config.seed_script {
        Some(script) => CommandSpec::new(python).arg("-c").arg(script),
        None => {
            let file: PathBuf = backend.join(SEED_SCRIPT_FILE);
            if !file.exists() {
                return None;
            }
            CommandSpec::new(python).arg(SEED_SCRIPT_FILE)
        }
    };
    Some(spec.cwd(backend))
}

async fn seed_sample_data(toolkit: &Toolkit, config: &RuntimeConfig) -> Result<(), StepFailure> {
    const CONTEXT: &str = "Generating test data";

    let spec = seed_command(config).ok_or_else(|| {
        StepFailure::new(
            CONTEXT,
            StepError::coded(
                ErrorCode::App002,
                format!(
                    "No sample data generator found: set seed_script or add {} to the backend",
                    SEED_SCRIPT_FILE
                ),
            ),
        )
    })?;

    toolkit.sink.info("Generating test data...");
    let output = toolkit.runner.run(&spec).await.context(CONTEXT)?;
    if !output.success() {
        return Err(StepFailure::new(
            CONTEXT,
            StepError::coded(ErrorCode::App002, output.combined_output().trim().to_string()),
        ));
    }
    toolkit
        .sink
        .success("Test data generation completed successfully");
    Ok(())
}

/// Seed sample data when a generator exists, only warning on failure.
pub async fn seed_best_effort(toolkit: &Toolkit, config: &RuntimeConfig) {
    if seed_command(config).is_none() {
        debug!("No sample data generator found, skipping");
        return;
    }
    if let Err(failure) = seed_sample_data(toolkit, config).await {
        toolkit
            .sink
            .warn(&format!("Failed to generate test data: {}", failure.error));
    }
}

/// Log the environment report, as done once at startup.
pub async fn log_startup_diagnostics(toolkit: &Toolkit, config: &RuntimeConfig) {
    let report = toolkit.diagnostics.collect(config).await;
    report.log_to(toolkit.sink.as_ref());
}
