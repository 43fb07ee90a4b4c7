//! Remedies for the recoverable catalog codes.
//!
//! | Code | Remedy |
//! |------|--------|
//! | `DEP_001` | [`RecreateEnvironment`] |
//! | `DEP_002` | [`UpgradeInstaller`] |
//! | `ENV_002` | [`VirtualenvFallback`] |
//! | `CFG_002` | [`WriteDefaultConfig`] |
//! | `PRC_001` | [`FreePort`] |
//! | `APP_001` | [`ImportCheck`] |
//! | `OLM_001` | [`StartOllama`] |
//! | `OLM_002` | [`PullModel`] |

mod app;
mod environment;
mod ollama;
mod port;

use std::sync::Arc;

use lens_core::RemedyRegistry;

use crate::toolkit::Toolkit;

pub use app::ImportCheck;
pub use environment::{RecreateEnvironment, UpgradeInstaller, VirtualenvFallback, WriteDefaultConfig};
pub use ollama::{PullModel, StartOllama};
pub use port::FreePort;

/// Registry with every remedy wired to `toolkit`.
pub fn default_registry(toolkit: &Toolkit) -> RemedyRegistry {
    let mut registry = RemedyRegistry::new();
    registry.register(Arc::new(RecreateEnvironment::new(toolkit.provisioner.clone())));
    registry.register(Arc::new(UpgradeInstaller::new(toolkit.provisioner.clone())));
    registry.register(Arc::new(VirtualenvFallback::new(
        toolkit.provisioner.clone(),
        toolkit.sink.clone(),
    )));
    registry.register(Arc::new(WriteDefaultConfig::new(toolkit.provisioner.clone())));
    registry.register(Arc::new(FreePort::new(
        toolkit.resolver.clone(),
        toolkit.sink.clone(),
    )));
    registry.register(Arc::new(ImportCheck::new(
        toolkit.runner.clone(),
        toolkit.resolver.clone(),
        toolkit.sink.clone(),
    )));
    registry.register(Arc::new(StartOllama::new(toolkit.verifier.clone())));
    registry.register(Arc::new(PullModel::new(
        toolkit.verifier.clone(),
        toolkit.sink.clone(),
    )));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_core::{ErrorCode, MemorySink, RuntimeConfig};
    use lens_runner::{MockCommandRunner, MockOllamaApi, MockPortProbe, MockProcessTable};

    #[test]
    fn test_default_registry_covers_recoverable_codes() {
        let toolkit = Toolkit::new(
            &RuntimeConfig::default(),
            Arc::new(MockCommandRunner::new()),
            Arc::new(MockProcessTable::new()),
            Arc::new(MockPortProbe::new()),
            Arc::new(MockOllamaApi::new()),
            Arc::new(MemorySink::new()),
        );
        let registry = default_registry(&toolkit);
        assert_eq!(
            registry.codes(),
            vec![
                ErrorCode::Env002,
                ErrorCode::Dep001,
                ErrorCode::Dep002,
                ErrorCode::Prc001,
                ErrorCode::Cfg002,
                ErrorCode::App001,
                ErrorCode::Olm001,
                ErrorCode::Olm002,
            ]
        );
        assert!(!registry.contains(ErrorCode::Sys004));
    }
}
