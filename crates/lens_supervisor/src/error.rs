//! Error types for the supervisor module.

use std::io;

use lens_core::{CoreError, ErrorCode, Failure, StepError};
use lens_runner::RunnerError;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors that can end a supervisor operation.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A step failed and recovery did not fix it. Already reported.
    #[error("{code}: {message}")]
    Unrecovered { code: ErrorCode, message: String },

    #[error("Port {0} is still in use after cleanup")]
    PortStillInUse(u16),

    #[error("Operation interrupted by user")]
    Interrupted,

    #[error("Invalid supervisor state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Whether the dispatcher has already seen this error.
    pub fn is_reported(&self) -> bool {
        matches!(self, Self::Unrecovered { .. } | Self::Interrupted)
    }

    /// The raw failure to classify when this error reaches the command level.
    pub fn to_failure(&self) -> Failure {
        match self {
            Self::Step(StepError::Raw(failure)) => failure.clone(),
            Self::Step(StepError::Coded(err)) => err
                .cause()
                .cloned()
                .unwrap_or_else(|| Failure::other(err.message())),
            Self::Runner(err) => Failure::new(err.kind(), err.to_string()),
            Self::Io(err) => Failure::from(io::Error::new(err.kind(), err.to_string())),
            Self::PortStillInUse(_) => Failure::os(self.to_string()),
            other => Failure::other(other.to_string()),
        }
    }
}
