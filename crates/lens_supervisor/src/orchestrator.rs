//! Lifecycle orchestration.
//!
//! The [`Orchestrator`] drives a run through its states, one step at a time.
//! A failing step is classified, handed to the recovery dispatcher, and
//! retried when recovery succeeds, up to a fixed number of retries per step.
//!
//! # Example
//!
//! ```rust,ignore
//! use lens_core::{RuntimeConfig, TracingSink};
//! use lens_supervisor::{Orchestrator, Toolkit};
//!
//! let config = RuntimeConfig::default();
//! let toolkit = Toolkit::system(&config, Arc::new(TracingSink));
//! let mut orchestrator = Orchestrator::new(config, toolkit);
//! let summary = orchestrator.start(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

use std::future::Future;

use lens_core::{
    Classifier, ConfigPatch, ErrorCode, Failure, RecoveryDispatcher, RecoveryOutcome,
    RuntimeConfig, SharedSink,
};
use lens_runner::{ChildHandle, ExitInfo, RunnerResult};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};
use crate::state::SupervisorState;
use crate::steps::{self, ServerSlot, Step};
use crate::toolkit::Toolkit;

/// Recovered retries allowed per step.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped on request.
    Shutdown,
    /// The server exited on its own.
    Exited(ExitInfo),
}

/// Summary of a finished `start`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub host: String,
    pub port: u16,
    #[serde(skip)]
    pub outcome: RunOutcome,
}

impl RunSummary {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Shutdown => 0,
            RunOutcome::Exited(exit) if exit.success() => 0,
            RunOutcome::Exited(_) => 1,
        }
    }
}

enum RunningEvent {
    Exited(RunnerResult<ExitInfo>),
    Shutdown,
}

/// Drives a supervisor run through its lifecycle.
pub struct Orchestrator {
    config: RuntimeConfig,
    toolkit: Toolkit,
    dispatcher: RecoveryDispatcher,
    classifier: Classifier,
    state: SupervisorState,
    history: Vec<SupervisorState>,
    /// Server spawned by `Launch`, until `start` takes it over.
    server: ServerSlot,
    run_id: Uuid,
    retry_limit: u32,
}

impl Orchestrator {
    pub fn new(config: RuntimeConfig, toolkit: Toolkit) -> Self {
        let dispatcher = toolkit.dispatcher();
        let classifier = toolkit.classifier(&config);
        Self {
            config,
            toolkit,
            dispatcher,
            classifier,
            state: SupervisorState::Idle,
            history: vec![SupervisorState::Idle],
            server: None,
            run_id: Uuid::new_v4(),
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[SupervisorState] {
        &self.history
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn dispatcher(&self) -> &RecoveryDispatcher {
        &self.dispatcher
    }

    fn sink(&self) -> &SharedSink {
        &self.toolkit.sink
    }

    fn transition(&mut self, next: SupervisorState) {
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.run_id, "Unexpected state change {} -> {}", self.state, next);
        }
        debug!(run_id = %self.run_id, "State {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Run `step`, recovering and retrying until it succeeds or recovery gives up.
    async fn run_step(&mut self, step: Step) -> SupervisorResult<()> {
        let mut retries = 0;
        loop {
            let failure =
                match steps::execute(step, &self.toolkit, &self.config, &mut self.server).await {
                    Ok(()) => return Ok(()),
                    Err(failure) => failure,
                };
            let error = self.classifier.resolve(&failure.error, Some(&failure.context));

            if retries >= self.retry_limit {
                self.dispatcher.report(&error, Some(&failure.context));
                self.sink().error(&format!(
                    "{} still failing after {} recovery attempts",
                    step, retries
                ));
                return self.give_up(step, error.code(), error.message().to_string());
            }

            match self
                .dispatcher
                .handle(&error, Some(&failure.context), &self.config)
                .await
            {
                RecoveryOutcome::Recovered => {}
                RecoveryOutcome::RetryWithChanges(patch) => self.config.apply(&patch),
                _ => return self.give_up(step, error.code(), error.message().to_string()),
            }

            retries += 1;
            info!(run_id = %self.run_id, "Retrying {} after recovery ({}/{})", step, retries, self.retry_limit);
        }
    }

    fn give_up(
        &mut self,
        step: Step,
        code: ErrorCode,
        message: String,
    ) -> SupervisorResult<()> {
        if step == Step::VerifyExternalService && !self.config.ollama.required {
            self.sink().warn("LLM features will be disabled");
            self.config.apply(&ConfigPatch::new().ollama_enabled(false));
            return Ok(());
        }
        self.transition(SupervisorState::Failed);
        Err(SupervisorError::Unrecovered { code, message })
    }

    async fn bring_up(&mut self) -> SupervisorResult<()> {
        self.transition(SupervisorState::ProvisioningEnv);
        steps::log_startup_diagnostics(&self.toolkit, &self.config).await;
        self.run_step(Step::Provision).await?;

        self.transition(SupervisorState::ResolvingConflicts);
        self.run_step(Step::ResolveConflicts).await?;

        self.transition(SupervisorState::VerifyingExternalService);
        if self.config.ollama.enabled && self.config.ollama.verify_on_startup {
            self.run_step(Step::VerifyExternalService).await?;
        }

        steps::seed_best_effort(&self.toolkit, &self.config).await;

        self.transition(SupervisorState::Launching);
        self.run_step(Step::Launch).await
    }

    /// Stop a server whose launch was cut short, with the same grace as a
    /// normal shutdown.
    async fn stop_launched_server(&mut self) {
        let Some(mut child) = self.server.take() else {
            return;
        };
        self.sink().info("Stopping LogicLens application...");
        match child.terminate(self.config.timeouts.shutdown()).await {
            Ok(exit) => debug!("Server stopped with {}", exit),
            Err(e) => self.sink().warn(&format!("Failed to stop the server: {}", e)),
        }
    }

    /// Provision, resolve conflicts, verify, launch, then supervise the
    /// server until it exits or `shutdown` resolves.
    ///
    /// `shutdown` resolving before the server is running aborts the run with
    /// [`SupervisorError::Interrupted`], terminating a server that was
    /// already spawned.
    pub async fn start<F>(&mut self, shutdown: F) -> SupervisorResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(run_id = %self.run_id, "Starting supervisor run");
        self.sink().info("Starting LogicLens application...");

        let launched = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            result = self.bring_up() => Some(result),
        };
        match launched {
            Some(result) => result?,
            None => {
                self.stop_launched_server().await;
                self.transition(SupervisorState::Failed);
                return Err(SupervisorError::Interrupted);
            }
        }
        let Some(mut child) = self.server.take() else {
            return Err(SupervisorError::InvalidState(
                "launch finished without a server process".to_string(),
            ));
        };

        self.transition(SupervisorState::Running);
        self.sink().success("LogicLens application started successfully");
        self.sink().info("Press Ctrl+C to stop the server");

        let event = tokio::select! {
            exit = child.wait() => RunningEvent::Exited(exit),
            _ = &mut shutdown => RunningEvent::Shutdown,
        };

        let outcome = match event {
            RunningEvent::Shutdown => {
                self.sink().info("Stopping LogicLens application...");
                let exit = child.terminate(self.config.timeouts.shutdown()).await?;
                debug!("Server stopped with {}", exit);
                self.sink().success("LogicLens application stopped");
                RunOutcome::Shutdown
            }
            RunningEvent::Exited(exit) => {
                let exit = exit?;
                if !exit.success() {
                    self.report_unexpected_exit(exit).await;
                } else {
                    self.sink().info("Server exited");
                }
                RunOutcome::Exited(exit)
            }
        };

        self.transition(SupervisorState::Stopped);
        Ok(RunSummary {
            run_id: self.run_id,
            host: self.config.host.clone(),
            port: self.config.port,
            outcome,
        })
    }

    async fn report_unexpected_exit(&mut self, exit: ExitInfo) {
        let context = format!("Running {} server", self.config.service.name);
        let failure = Failure::subprocess(format!(
            "Flask process terminated unexpectedly with {}",
            exit
        ));
        let error = self.classifier.classify(&failure, Some(&context));
        self.dispatcher
            .handle(&error, Some(&context), &self.config)
            .await;
    }

    /// Provision the environment without starting the server.
    pub async fn setup(&mut self) -> SupervisorResult<()> {
        self.sink().info("Setting up LogicLens environment...");
        self.transition(SupervisorState::ProvisioningEnv);
        self.run_step(Step::Provision).await?;
        steps::seed_best_effort(&self.toolkit, &self.config).await;
        self.transition(SupervisorState::Stopped);
        self.sink()
            .success("LogicLens environment setup completed successfully");
        Ok(())
    }

    /// Ensure the interpreter exists, then seed sample data.
    pub async fn seed(&mut self) -> SupervisorResult<()> {
        self.transition(SupervisorState::ProvisioningEnv);
        self.run_step(Step::PrepareInterpreter).await?;
        self.run_step(Step::SeedSampleData).await?;
        self.transition(SupervisorState::Stopped);
        Ok(())
    }

    /// Verify the inference backend with recovery. Returns whether it is
    /// still enabled afterwards.
    pub async fn verify_external_service(&mut self) -> SupervisorResult<bool> {
        if !self.config.ollama.enabled {
            self.sink().info("Ollama integration is disabled in config");
            return Ok(false);
        }
        self.sink().info("Verifying Ollama setup...");
        self.transition(SupervisorState::VerifyingExternalService);
        self.run_step(Step::VerifyExternalService).await?;
        self.transition(SupervisorState::Stopped);

        if self.config.ollama.enabled {
            self.sink().success(&format!(
                "Ollama verified: using model '{}' at {}",
                self.config.ollama.model, self.config.ollama.host
            ));
        }
        Ok(self.config.ollama.enabled)
    }
}
