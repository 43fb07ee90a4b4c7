//! Mapping raw failures onto catalog codes.
//!
//! Classification is a priority-ordered list of keyword rules over the
//! failure kind, its message and the caller-supplied context string. It does no logging or I/O, and the same input
//! always yields the same code. Reporting is the dispatcher's job.

use crate::catalog::ErrorCode;
use crate::failure::{Failure, FailureKind, LensError, StepError};

/// Keyword-driven failure classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
    /// Token identifying the supervised server in context strings.
    service_name: String,
    /// Token identifying the external inference backend.
    external_service: String,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new("flask", "ollama")
    }
}

impl Classifier {
    pub fn new(service_name: impl Into<String>, external_service: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into().to_lowercase(),
            external_service: external_service.into().to_lowercase(),
        }
    }

    /// Map a raw failure to a structured error.
    pub fn classify(&self, failure: &Failure, context: Option<&str>) -> LensError {
        let code = self.code_for(failure, context);
        LensError::with_message(code, failure.message.clone()).caused_by(failure.clone())
    }

    /// Resolve a step error: coded errors pass through untouched.
    pub fn resolve(&self, err: &StepError, context: Option<&str>) -> LensError {
        match err {
            StepError::Coded(coded) => coded.clone(),
            StepError::Raw(failure) => self.classify(failure, context),
        }
    }

    /// The code a failure maps to.
    pub fn code_for(&self, failure: &Failure, context: Option<&str>) -> ErrorCode {
        let message = failure.message.to_lowercase();
        let context = context.unwrap_or_default().to_lowercase();
        let mentions = |needle: &str| message.contains(needle) || context.contains(needle);

        match failure.kind {
            FailureKind::NotFound => {
                return if mentions("pip") {
                    ErrorCode::Dep001
                } else if mentions("python") || mentions("interpreter") {
                    ErrorCode::Env001
                } else if mentions(".env") {
                    ErrorCode::Cfg002
                } else {
                    ErrorCode::Env004
                };
            }
            FailureKind::PermissionDenied => return ErrorCode::Env005,
            FailureKind::Subprocess => {
                if context.contains("install") {
                    return ErrorCode::Dep002;
                }
                if context.contains("venv")
                    || context.contains("virtual environment")
                    || context.contains("isolat")
                {
                    return ErrorCode::Env002;
                }
                if context.contains(&self.service_name) {
                    return ErrorCode::App001;
                }
            }
            FailureKind::Os => {
                if context.contains("socket") || context.contains("bind") || context.contains("port")
                {
                    return ErrorCode::Prc001;
                }
                if context.contains("kill") || context.contains("terminat") {
                    return ErrorCode::Prc002;
                }
            }
            FailureKind::Timeout | FailureKind::Network | FailureKind::Other => {}
        }

        if mentions(&self.external_service) {
            return if message.contains("connection") || message.contains("unreachable") {
                ErrorCode::Olm001
            } else if message.contains("model not found") || message.contains("model unavailable")
            {
                ErrorCode::Olm002
            } else if message.contains("timeout") || message.contains("timed out") {
                ErrorCode::Olm003
            } else if message.contains("api") {
                ErrorCode::Olm004
            } else {
                ErrorCode::Olm005
            };
        }

        ErrorCode::Sys004
    }
}
