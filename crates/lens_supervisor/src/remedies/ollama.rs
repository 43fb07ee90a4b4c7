use std::sync::Arc;

use async_trait::async_trait;
use lens_core::{CoreResult, ErrorCode, Remedy, RemedyOutcome, RuntimeConfig, SharedSink};
use lens_runner::ExternalServiceVerifier;

/// `OLM_001`: install Ollama if needed and start the server.
pub struct StartOllama {
    verifier: Arc<ExternalServiceVerifier>,
}

impl StartOllama {
    pub fn new(verifier: Arc<ExternalServiceVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Remedy for StartOllama {
    fn code(&self) -> ErrorCode {
        ErrorCode::Olm001
    }

    fn description(&self) -> &str {
        "Install and start the Ollama server"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        Ok(match self.verifier.ensure_running(config).await {
            Ok(()) => RemedyOutcome::Recovered,
            Err(e) => RemedyOutcome::failed(e.to_string()),
        })
    }
}

/// `OLM_002`: pull the configured model.
pub struct PullModel {
    verifier: Arc<ExternalServiceVerifier>,
    sink: SharedSink,
}

impl PullModel {
    pub fn new(verifier: Arc<ExternalServiceVerifier>, sink: SharedSink) -> Self {
        Self { verifier, sink }
    }
}

#[async_trait]
impl Remedy for PullModel {
    fn code(&self) -> ErrorCode {
        ErrorCode::Olm002
    }

    fn description(&self) -> &str {
        "Pull the configured Ollama model"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        if let Err(e) = self.verifier.ensure_running(config).await {
            return Ok(RemedyOutcome::failed(e.to_string()));
        }

        match self.verifier.pull_model(config).await {
            Ok(()) => Ok(RemedyOutcome::Recovered),
            Err(e) => {
                let models = self.verifier.list_models().await;
                if models.is_empty() {
                    self.sink.info("No models are available locally");
                } else {
                    self.sink
                        .info(&format!("Available models: {}", models.join(", ")));
                }
                Ok(RemedyOutcome::failed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_core::MemorySink;
    use lens_runner::{MockCommandRunner, MockOllamaApi, OllamaApi};

    fn verifier(api: &MockOllamaApi, runner: &MockCommandRunner, sink: &MemorySink) -> Arc<ExternalServiceVerifier> {
        Arc::new(ExternalServiceVerifier::new(
            Arc::new(api.clone()),
            Arc::new(runner.clone()),
            Arc::new(sink.clone()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ollama_installs_then_serves() {
        let api = MockOllamaApi::unreachable();
        let started = api.clone();
        let runner = MockCommandRunner::new().with_hook("ollama serve", move |_| started.set_reachable(true));
        let sink = MemorySink::new();

        let outcome = StartOllama::new(verifier(&api, &runner, &sink))
            .apply(&RuntimeConfig::default(), None)
            .await
            .unwrap();

        if lens_runner::installable() {
            assert_eq!(outcome, RemedyOutcome::Recovered);
            assert!(runner.was_called("install.sh"));
            assert!(api.is_healthy().await);
        } else {
            assert!(!outcome.is_success());
        }
    }

    #[tokio::test]
    async fn test_pull_model_adds_configured_model() {
        let api = MockOllamaApi::new().with_models(["mistral:latest"]);
        let runner = MockCommandRunner::new().with_program("ollama");
        let sink = MemorySink::new();

        let outcome = PullModel::new(verifier(&api, &runner, &sink), Arc::new(sink.clone()))
            .apply(&RuntimeConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome, RemedyOutcome::Recovered);
        assert_eq!(api.pulled(), vec!["llama2"]);
    }

    #[tokio::test]
    async fn test_failed_pull_lists_available_models() {
        let api = MockOllamaApi::new()
            .with_models(["mistral:latest"])
            .failing_pulls();
        let sink = MemorySink::new();

        let outcome = PullModel::new(verifier(&api, &MockCommandRunner::new(), &sink), Arc::new(sink.clone()))
            .apply(&RuntimeConfig::default(), None)
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert!(sink.contains("Available models: mistral:latest"));
    }
}
