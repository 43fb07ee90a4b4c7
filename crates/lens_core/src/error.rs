//! Error types for the core module.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur inside the core crate itself.
///
/// These are distinct from [`crate::LensError`], which describes a failure of
/// the supervised environment rather than of the supervisor.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown error code: {0}")]
    UnknownCode(String),

    #[error("Invalid configuration in {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
