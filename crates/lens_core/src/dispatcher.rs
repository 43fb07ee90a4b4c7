//! Recovery dispatcher.
//!
//! Reports a coded error, then runs the registered remedy for it at most
//! once per (code, context) pair. Dispatchers built over the same
//! [`SharedLedger`] share that guarantee.

use std::fmt;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::debug;

use crate::config::{ConfigPatch, RuntimeConfig};
use crate::diagnostics::EnvironmentProbe;
use crate::failure::LensError;
use crate::ledger::{RecoveryKey, RecoveryLedger, SharedLedger};
use crate::remedy::{RemedyOutcome, RemedyRegistry};
use crate::sink::SharedSink;

/// What happened when an error was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The remedy fixed the problem.
    Recovered,
    /// The remedy fixed the problem provided the patch is applied.
    RetryWithChanges(ConfigPatch),
    /// The remedy ran and failed, or returned an error.
    Failed(String),
    /// A remedy for this pair was already attempted.
    Skipped,
    /// No remedy is registered for the code.
    NoRemedy,
}

impl RecoveryOutcome {
    pub fn recovered(&self) -> bool {
        matches!(self, Self::Recovered | Self::RetryWithChanges(_))
    }

    pub fn patch(&self) -> Option<&ConfigPatch> {
        match self {
            Self::RetryWithChanges(patch) => Some(patch),
            _ => None,
        }
    }
}

impl From<RemedyOutcome> for RecoveryOutcome {
    fn from(outcome: RemedyOutcome) -> Self {
        match outcome {
            RemedyOutcome::Recovered => Self::Recovered,
            RemedyOutcome::RetryWithChanges(patch) => Self::RetryWithChanges(patch),
            RemedyOutcome::Failed(reason) => Self::Failed(reason),
        }
    }
}

/// Routes coded errors to remedies.
pub struct RecoveryDispatcher {
    registry: Arc<RemedyRegistry>,
    ledger: SharedLedger,
    sink: SharedSink,
    probe: Option<Arc<dyn EnvironmentProbe>>,
}

impl RecoveryDispatcher {
    pub fn new(registry: Arc<RemedyRegistry>, sink: SharedSink) -> Self {
        Self {
            registry,
            ledger: RecoveryLedger::shared(),
            sink,
            probe: None,
        }
    }

    /// Attach a probe run for environment and system errors.
    pub fn with_probe(mut self, probe: Arc<dyn EnvironmentProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Record attempts in `ledger` instead of a private one.
    pub fn with_ledger(mut self, ledger: SharedLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> MutexGuard<'_, RecoveryLedger> {
        self.ledger.lock()
    }

    pub fn registry(&self) -> &RemedyRegistry {
        &self.registry
    }

    /// Report `error` and attempt recovery.
    pub async fn handle(
        &self,
        error: &LensError,
        context: Option<&str>,
        config: &RuntimeConfig,
    ) -> RecoveryOutcome {
        let code = error.code();
        self.report(error, context);

        if code.category().wants_diagnostics() {
            if let Some(probe) = &self.probe {
                let report = probe.collect(config).await;
                report.log_to(self.sink.as_ref());
            }
        }

        let key = RecoveryKey::new(code, context);
        let label = key.context.clone();
        if !self.ledger.lock().record(key) {
            self.sink.warn(&format!(
                "Recovery already attempted for {} in context '{}', skipping",
                code, label
            ));
            return RecoveryOutcome::Skipped;
        }

        let Some(remedy) = self.registry.get(code) else {
            self.sink
                .warn(&format!("No recovery method available for {}", code));
            return RecoveryOutcome::NoRemedy;
        };

        self.sink.info(&format!(
            "Attempting recovery for {}: {}",
            code,
            remedy.description()
        ));
        let outcome = match remedy.apply(config, context).await {
            Ok(outcome) => RecoveryOutcome::from(outcome),
            Err(e) => {
                self.sink
                    .error(&format!("Error during recovery attempt: {}", e));
                RecoveryOutcome::Failed(e.to_string())
            }
        };

        if outcome.recovered() {
            self.sink.success(&format!("Recovery successful for {}", code));
        } else {
            if let RecoveryOutcome::Failed(reason) = &outcome {
                debug!("Remedy for {} failed: {}", code, reason);
            }
            self.sink.error(&format!("Recovery failed for {}", code));
        }
        outcome
    }

    /// Log `error` with its catalog description, without attempting recovery.
    pub fn report(&self, error: &LensError, context: Option<&str>) {
        self.sink
            .error(&format!("ERROR {}: {}", error.code(), error.description()));
        if error.message() != error.description() {
            self.sink.error(&format!("Details: {}", error.message()));
        }
        if let Some(context) = context {
            self.sink.error(&format!("Context: {}", context));
        }
        if let Some(cause) = error.cause() {
            self.sink.error(&format!("Original error: {}", cause));
        }
    }
}

impl fmt::Debug for RecoveryDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryDispatcher")
            .field("registry", &self.registry)
            .field("attempted", &self.ledger.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ErrorCode;
    use crate::sink::{MemorySink, Severity};

    #[tokio::test]
    async fn test_unregistered_code_reports_no_remedy() {
        let sink = MemorySink::new();
        let dispatcher =
            RecoveryDispatcher::new(Arc::new(RemedyRegistry::new()), Arc::new(sink.clone()));

        let err = LensError::new(ErrorCode::Sys002);
        let outcome = dispatcher
            .handle(&err, Some("checking memory"), &RuntimeConfig::default())
            .await;

        assert_eq!(outcome, RecoveryOutcome::NoRemedy);
        assert!(!outcome.recovered());
        assert!(sink.contains("ERROR SYS_002: Insufficient memory"));
        assert!(sink.contains("Context: checking memory"));
        assert_eq!(sink.count(Severity::Warning, "No recovery method available for SYS_002"), 1);
        assert_eq!(dispatcher.ledger().len(), 1);
    }
}
