//! Raw failures and structured (coded) errors.
//!
//! A step that goes wrong produces either a raw [`Failure`], which only knows
//! its broad category and message, or an already coded [`LensError`]. Raw
//! failures are turned into coded ones by the [`crate::Classifier`] before
//! anything is reported to the operator.

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ErrorCode;

/// Broad category of a raw failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A file, directory or executable was missing.
    NotFound,
    /// The operating system refused access.
    PermissionDenied,
    /// A child process could not be run or exited unsuccessfully.
    Subprocess,
    /// Any other operating-system level error (sockets, signals, ...).
    Os,
    /// An operation exceeded its deadline.
    Timeout,
    /// An HTTP or network request failed.
    Network,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::Subprocess => "Subprocess",
            Self::Os => "Os",
            Self::Timeout => "Timeout",
            Self::Network => "Network",
            Self::Other => "Other",
        };
        f.write_str(name)
    }
}

/// An unclassified failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PermissionDenied, message)
    }

    pub fn subprocess(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Subprocess, message)
    }

    pub fn os(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Os, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => FailureKind::NotFound,
            io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
            io::ErrorKind::TimedOut => FailureKind::Timeout,
            _ => FailureKind::Os,
        };
        Self::new(kind, err.to_string())
    }
}

/// A failure mapped to a catalog code.
///
/// Built once at classification time and never modified afterwards.
#[derive(Error, Debug, Clone, Serialize)]
#[error("{code}: {message}")]
pub struct LensError {
    code: ErrorCode,
    message: String,
    cause: Option<Failure>,
    timestamp: DateTime<Utc>,
}

impl LensError {
    /// Create an error whose message is the catalog description.
    pub fn new(code: ErrorCode) -> Self {
        Self::with_message(code, code.description())
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the raw failure this error was derived from.
    pub fn caused_by(mut self, cause: Failure) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn description(&self) -> &'static str {
        self.code.description()
    }

    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// What a supervisor step returns when it cannot complete.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error(transparent)]
    Coded(#[from] LensError),

    #[error(transparent)]
    Raw(#[from] Failure),
}

impl StepError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Coded(LensError::with_message(code, message))
    }
}

impl From<io::Error> for StepError {
    fn from(err: io::Error) -> Self {
        Self::Raw(Failure::from(err))
    }
}

/// Result alias for supervisor steps.
pub type StepResult<T> = Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_defaults_to_description() {
        let err = LensError::new(ErrorCode::Prc001);
        assert_eq!(err.message(), "Port already in use");
        assert!(err.cause().is_none());
        assert_eq!(err.to_string(), "PRC_001: Port already in use");
    }

    #[test]
    fn test_io_error_kinds_map_to_failure_kinds() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert_eq!(Failure::from(missing).kind, FailureKind::NotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Failure::from(denied).kind, FailureKind::PermissionDenied);

        let refused = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        assert_eq!(Failure::from(refused).kind, FailureKind::Os);
    }

    #[test]
    fn test_caused_by_keeps_original_failure() {
        let err = LensError::new(ErrorCode::Dep001).caused_by(Failure::not_found("venv/bin/pip"));
        assert_eq!(err.cause().map(|c| c.kind), Some(FailureKind::NotFound));
    }
}
