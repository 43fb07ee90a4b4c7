//! The services a supervisor run works with.

use std::sync::Arc;

use lens_core::{Classifier, RecoveryDispatcher, RecoveryLedger, RuntimeConfig, SharedLedger, SharedSink};
use lens_runner::{
    platform_table, DiagnosticsCollector, EnvironmentProvisioner, ExternalServiceVerifier,
    OllamaApi, OllamaClient, PortProbe, ProcessResolver, ProcessTable, SharedRunner,
    SystemCommandRunner, TcpPortProbe,
};

use crate::remedies;

/// Name the classifier looks for when routing external-service failures.
pub const EXTERNAL_SERVICE: &str = "ollama";

/// Runner-layer services shared by steps, remedies and operations.
///
/// Cloning is cheap; everything inside is reference counted, including the
/// recovery ledger, so clones share one at-most-once record.
#[derive(Clone)]
pub struct Toolkit {
    pub runner: SharedRunner,
    pub resolver: ProcessResolver,
    pub provisioner: Arc<EnvironmentProvisioner>,
    pub verifier: Arc<ExternalServiceVerifier>,
    pub diagnostics: Arc<DiagnosticsCollector>,
    pub sink: SharedSink,
    ledger: SharedLedger,
}

impl Toolkit {
    pub fn new(
        config: &RuntimeConfig,
        runner: SharedRunner,
        table: Arc<dyn ProcessTable>,
        probe: Arc<dyn PortProbe>,
        api: Arc<dyn OllamaApi>,
        sink: SharedSink,
    ) -> Self {
        let resolver = ProcessResolver::new(table, probe.clone())
            .grace(config.timeouts.terminate_grace());
        Self {
            provisioner: Arc::new(EnvironmentProvisioner::new(runner.clone(), sink.clone())),
            verifier: Arc::new(ExternalServiceVerifier::new(api, runner.clone(), sink.clone())),
            diagnostics: Arc::new(DiagnosticsCollector::new(runner.clone(), probe)),
            resolver,
            runner,
            sink,
            ledger: RecoveryLedger::shared(),
        }
    }

    /// Toolkit backed by real processes, sockets and HTTP.
    pub fn system(config: &RuntimeConfig, sink: SharedSink) -> Self {
        let runner: SharedRunner = Arc::new(SystemCommandRunner::new());
        let table = platform_table(runner.clone());
        Self::new(
            config,
            runner,
            table,
            Arc::new(TcpPortProbe::new()),
            Arc::new(OllamaClient::from_config(&config.ollama)),
            sink,
        )
    }

    pub fn classifier(&self, config: &RuntimeConfig) -> Classifier {
        Classifier::new(&config.service.name, EXTERNAL_SERVICE)
    }

    /// Dispatcher with every remedy registered and diagnostics attached.
    /// All dispatchers of a toolkit record into the same ledger.
    pub fn dispatcher(&self) -> RecoveryDispatcher {
        let registry = remedies::default_registry(self);
        RecoveryDispatcher::new(Arc::new(registry), self.sink.clone())
            .with_probe(self.diagnostics.clone())
            .with_ledger(self.ledger.clone())
    }
}
