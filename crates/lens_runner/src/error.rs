//! Error types for the runner module.

use std::io;

use lens_core::{Failure, FailureKind, StepError};
use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while running commands or talking to services.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with status {}: {stderr}", exit_status(.code))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl RunnerError {
    /// Broad failure category, used when the error is handed to the classifier.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Spawn { source, .. } | Self::Io(source) => match source.kind() {
                io::ErrorKind::NotFound => FailureKind::NotFound,
                io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
                io::ErrorKind::TimedOut => FailureKind::Timeout,
                _ => FailureKind::Os,
            },
            Self::CommandFailed { .. } => FailureKind::Subprocess,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Http(e) if e.is_timeout() => FailureKind::Timeout,
            Self::Http(_) => FailureKind::Network,
            Self::Api { .. } | Self::Json(_) => FailureKind::Other,
        }
    }
}

impl From<RunnerError> for Failure {
    fn from(err: RunnerError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}

impl From<RunnerError> for StepError {
    fn from(err: RunnerError) -> Self {
        StepError::Raw(Failure::from(err))
    }
}
