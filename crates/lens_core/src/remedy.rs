//! Remedies and the registry that maps error codes to them.
//!
//! # Remedy Lifecycle
//!
//! 1. **Registration**: remedies are registered with a [`RemedyRegistry`] under
//!    the code they handle, once at startup.
//! 2. **Lookup**: the [`crate::RecoveryDispatcher`] looks the code up when an
//!    error is handled.
//! 3. **Application**: the remedy inspects the configuration and the
//!    environment and returns a [`RemedyOutcome`].
//!
//! Remedies never mutate the configuration. A remedy that wants the failed
//! step retried with different settings returns
//! [`RemedyOutcome::RetryWithChanges`] carrying a [`ConfigPatch`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::catalog::ErrorCode;
use crate::config::{ConfigPatch, RuntimeConfig};
use crate::error::CoreResult;

/// Result of applying a remedy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemedyOutcome {
    /// The underlying problem is fixed; retry the step as-is.
    Recovered,
    /// Retry the step after merging the patch.
    RetryWithChanges(ConfigPatch),
    /// The remedy could not fix the problem.
    Failed(String),
}

impl RemedyOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// `Recovered`, or `RetryWithChanges` when the patch is not empty.
    pub fn recovered_with(patch: ConfigPatch) -> Self {
        if patch.is_empty() {
            Self::Recovered
        } else {
            Self::RetryWithChanges(patch)
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn patch(&self) -> Option<&ConfigPatch> {
        match self {
            Self::RetryWithChanges(patch) => Some(patch),
            _ => None,
        }
    }
}

impl fmt::Display for RemedyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recovered => write!(f, "recovered"),
            Self::RetryWithChanges(_) => write!(f, "retry with changes"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A corrective action for one catalog code.
#[async_trait]
pub trait Remedy: Send + Sync {
    /// The code this remedy handles.
    fn code(&self) -> ErrorCode;

    /// Short human-readable description.
    fn description(&self) -> &str;

    /// Attempt the fix.
    ///
    /// `Err` is reserved for failures of the remedy itself; a remedy that ran
    /// but could not fix the problem returns `Ok(RemedyOutcome::Failed(..))`.
    async fn apply(&self, config: &RuntimeConfig, context: Option<&str>)
        -> CoreResult<RemedyOutcome>;
}

/// Maps error codes to remedy implementations.
#[derive(Default)]
pub struct RemedyRegistry {
    remedies: HashMap<ErrorCode, Arc<dyn Remedy>>,
}

impl RemedyRegistry {
    pub fn new() -> Self {
        Self {
            remedies: HashMap::new(),
        }
    }

    /// Register a remedy under its `code()`, replacing any previous one.
    pub fn register(&mut self, remedy: Arc<dyn Remedy>) {
        let code = remedy.code();
        debug!("Registering remedy for {}: {}", code, remedy.description());
        self.remedies.insert(code, remedy);
    }

    pub fn get(&self, code: ErrorCode) -> Option<Arc<dyn Remedy>> {
        self.remedies.get(&code).cloned()
    }

    pub fn contains(&self, code: ErrorCode) -> bool {
        self.remedies.contains_key(&code)
    }

    /// Registered codes in catalog order.
    pub fn codes(&self) -> Vec<ErrorCode> {
        ErrorCode::ALL
            .iter()
            .copied()
            .filter(|code| self.remedies.contains_key(code))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.remedies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remedies.is_empty()
    }
}

impl fmt::Debug for RemedyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemedyRegistry")
            .field("remedies", &self.codes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRemedy {
        code: ErrorCode,
    }

    #[async_trait]
    impl Remedy for FixedRemedy {
        fn code(&self) -> ErrorCode {
            self.code
        }

        fn description(&self) -> &str {
            "Test remedy"
        }

        async fn apply(
            &self,
            _config: &RuntimeConfig,
            _context: Option<&str>,
        ) -> CoreResult<RemedyOutcome> {
            Ok(RemedyOutcome::Recovered)
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = RemedyRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(FixedRemedy { code: ErrorCode::Prc001 }));
        registry.register(Arc::new(FixedRemedy { code: ErrorCode::Dep001 }));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(ErrorCode::Prc001));
        assert!(registry.get(ErrorCode::Olm001).is_none());
        assert_eq!(registry.codes(), vec![ErrorCode::Dep001, ErrorCode::Prc001]);
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(
            RemedyOutcome::recovered_with(ConfigPatch::new()),
            RemedyOutcome::Recovered
        );
        let outcome = RemedyOutcome::recovered_with(ConfigPatch::new().port(5051));
        assert_eq!(outcome.patch().and_then(|p| p.port), Some(5051));
        assert!(outcome.is_success());
        assert!(!RemedyOutcome::failed("nope").is_success());
    }
}
