//! # lens_supervisor
//!
//! Lifecycle orchestration for the LogicLens service.
//!
//! The orchestrator walks a run through provisioning, conflict resolution,
//! Ollama verification and launch. Failing steps go through the classifier
//! and the recovery dispatcher; remedies for recoverable codes live in
//! [`remedies`].
//!
//! # State machine
//!
//! ```text
//! Idle -> ProvisioningEnv -> ResolvingConflicts -> VerifyingExternalService
//!      -> Launching -> Running -> Stopped
//! ```
//!
//! Any non-terminal state can move to `Failed`.

pub mod error;
pub mod operations;
pub mod orchestrator;
pub mod remedies;
pub mod state;
pub mod steps;
pub mod toolkit;

pub use error::{SupervisorError, SupervisorResult};
pub use operations::{
    configure_ollama, list_models, recover_command, show_ollama_config, status, stop,
    terminate_instances, ProcessSource, ServiceProcess, StatusReport, StopReport,
};
pub use orchestrator::{Orchestrator, RunOutcome, RunSummary, DEFAULT_RETRY_LIMIT};
pub use remedies::default_registry;
pub use state::SupervisorState;
pub use steps::{ServerSlot, Step, StepFailure};
pub use toolkit::{Toolkit, EXTERNAL_SERVICE};
