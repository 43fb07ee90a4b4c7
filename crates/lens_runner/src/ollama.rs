//! Ollama inference backend client and verifier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lens_core::{ErrorCode, OllamaConfig, RuntimeConfig, SharedSink, StepError, StepResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{CommandSpec, SharedRunner};
use crate::error::{RunnerError, RunnerResult};

/// Where the unattended installer lives.
pub const INSTALL_SCRIPT_URL: &str = "https://ollama.ai/install.sh";
/// Manual download page, for platforms without an unattended installer.
pub const DOWNLOAD_URL: &str = "https://ollama.ai/download";

/// The subset of the Ollama HTTP API the supervisor needs.
#[async_trait]
pub trait OllamaApi: Send + Sync {
    /// Names of locally available models (`GET /api/tags`).
    async fn list_models(&self) -> RunnerResult<Vec<String>>;

    /// Download a model (`POST /api/pull`).
    async fn pull_model(&self, model: &str) -> RunnerResult<()>;

    async fn is_healthy(&self) -> bool {
        self.list_models().await.is_ok()
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

/// HTTP client for a running Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    request_timeout: Duration,
    pull_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = OllamaConfig::default();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            probe_timeout: defaults.probe_timeout(),
            request_timeout: defaults.request_timeout(),
            pull_timeout: defaults.pull_timeout(),
        }
    }

    pub fn from_config(config: &OllamaConfig) -> Self {
        Self::new(&config.host)
            .with_probe_timeout(config.probe_timeout())
            .with_request_timeout(config.request_timeout())
            .with_pull_timeout(config.pull_timeout())
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn error_for_status(response: reqwest::Response) -> RunnerResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RunnerError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl OllamaApi for OllamaClient {
    async fn list_models(&self) -> RunnerResult<Vec<String>> {
        let url = self.tags_url();
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let tags: TagsResponse = Self::error_for_status(response).await?.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn pull_model(&self, model: &str) -> RunnerResult<()> {
        let url = format!("{}/api/pull", self.base_url);
        info!("Pulling model {} from {}", model, self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.pull_timeout)
            .json(&PullRequest {
                name: model,
                stream: false,
            })
            .send()
            .await?;
        Self::error_for_status(response).await?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        let request = self.client.get(self.tags_url()).timeout(self.probe_timeout);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Ollama health probe failed: {}", e);
                false
            }
        }
    }
}

/// Whether `wanted` is among `available`.
///
/// An untagged name matches any tag of the same model, and a `:latest` name
/// matches the bare model name.
pub fn model_available(available: &[String], wanted: &str) -> bool {
    let wanted_base = wanted.strip_suffix(":latest").unwrap_or(wanted);
    available.iter().any(|name| {
        if name == wanted {
            return true;
        }
        let (base, _tag) = name.split_once(':').unwrap_or((name.as_str(), ""));
        if wanted.contains(':') {
            name == wanted_base
        } else {
            base == wanted
        }
    })
}

/// Model names from `ollama list` output: skip the header, take the first column.
pub fn parse_model_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Whether the backend can be installed without operator interaction here.
pub fn installable() -> bool {
    !cfg!(windows)
}

/// Checks, installs, starts and provisions the inference backend.
pub struct ExternalServiceVerifier {
    api: Arc<dyn OllamaApi>,
    runner: SharedRunner,
    sink: SharedSink,
}

impl ExternalServiceVerifier {
    pub fn new(api: Arc<dyn OllamaApi>, runner: SharedRunner, sink: SharedSink) -> Self {
        Self { api, runner, sink }
    }

    pub fn is_installed(&self) -> bool {
        self.runner.which("ollama").is_some()
    }

    pub async fn is_healthy(&self) -> bool {
        self.api.is_healthy().await
    }

    /// Verify the backend is installed, reachable, and has the configured model.
    pub async fn verify(&self, config: &RuntimeConfig) -> StepResult<()> {
        let ollama = &config.ollama;
        if !ollama.enabled {
            debug!("Ollama integration disabled, skipping verification");
            return Ok(());
        }

        self.sink
            .info(&format!("Checking Ollama at {}...", ollama.host));

        if !self.is_installed() {
            return Err(if installable() {
                StepError::coded(ErrorCode::Olm001, "Ollama is not installed")
            } else {
                StepError::coded(
                    ErrorCode::Olm005,
                    format!("Ollama is not installed. Install it manually from {}", DOWNLOAD_URL),
                )
            });
        }

        let models = self.api.list_models().await.map_err(|e| {
            StepError::coded(
                ErrorCode::Olm001,
                format!("Ollama server not reachable at {}: {}", ollama.host, e),
            )
        })?;

        if !model_available(&models, &ollama.model) {
            return Err(StepError::coded(
                ErrorCode::Olm002,
                format!("Model '{}' not found in Ollama", ollama.model),
            ));
        }

        self.sink.success(&format!(
            "Ollama is running with model {} available",
            ollama.model
        ));
        Ok(())
    }

    /// Run the unattended installer.
    pub async fn install(&self) -> StepResult<()> {
        if !installable() {
            return Err(StepError::coded(
                ErrorCode::Olm005,
                format!("Automatic installation is not supported here, install Ollama manually from {}", DOWNLOAD_URL),
            ));
        }

        self.sink.info("Installing Ollama...");
        let download = CommandSpec::new("curl").args(["-fsSL", INSTALL_SCRIPT_URL]);
        let script = self.runner.run(&download).await?;
        if !script.success() || script.stdout.trim().is_empty() {
            return Err(StepError::coded(
                ErrorCode::Olm005,
                format!(
                    "Failed to download the Ollama installer from {}: {}",
                    INSTALL_SCRIPT_URL,
                    script.stderr.trim()
                ),
            ));
        }

        let spec = CommandSpec::new("sh").arg("-c").arg(&script.stdout);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(StepError::coded(
                ErrorCode::Olm005,
                format!("Ollama installation failed: {}", output.combined_output().trim()),
            ));
        }
        self.sink.success("Ollama installed successfully");
        Ok(())
    }

    /// Launch `ollama serve` in the background and wait for it to answer.
    pub async fn start_server(&self, config: &RuntimeConfig) -> StepResult<()> {
        self.sink.info("Starting Ollama server...");
        let pid = self
            .runner
            .spawn_detached(&CommandSpec::new("ollama").arg("serve"))
            .await?;
        debug!("ollama serve started with pid {:?}", pid);

        tokio::time::sleep(config.ollama.settle_delay()).await;

        if self.api.is_healthy().await {
            self.sink.success("Ollama server started successfully");
            Ok(())
        } else {
            Err(StepError::coded(
                ErrorCode::Olm001,
                format!("Ollama server did not respond at {} after starting", config.ollama.host),
            ))
        }
    }

    /// Make the server reachable, installing and starting it as needed.
    pub async fn ensure_running(&self, config: &RuntimeConfig) -> StepResult<()> {
        if self.api.is_healthy().await {
            return Ok(());
        }
        if !self.is_installed() {
            self.install().await?;
        }
        self.start_server(config).await
    }

    /// Pull the configured model.
    pub async fn pull_model(&self, config: &RuntimeConfig) -> StepResult<()> {
        let model = &config.ollama.model;
        self.sink.info(&format!("Pulling Ollama model {}...", model));
        self.api.pull_model(model).await.map_err(|e| {
            StepError::coded(ErrorCode::Olm002, format!("Failed to pull model {}: {}", model, e))
        })?;
        self.sink
            .success(&format!("Model {} pulled successfully", model));
        Ok(())
    }

    /// Locally available models, from the CLI when present, else from the API.
    pub async fn list_models(&self) -> Vec<String> {
        if self.is_installed() {
            let spec = CommandSpec::new("ollama").arg("list");
            if let Ok(output) = self.runner.run(&spec).await {
                if output.success() {
                    return parse_model_list(&output.stdout);
                }
            }
        }
        self.api.list_models().await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommandRunner, MockOllamaApi, MockResponse};
    use lens_core::MemorySink;

    fn verifier(api: MockOllamaApi, runner: MockCommandRunner) -> ExternalServiceVerifier {
        ExternalServiceVerifier::new(Arc::new(api), Arc::new(runner), Arc::new(MemorySink::new()))
    }

    fn code_of(err: StepError) -> ErrorCode {
        match err {
            StepError::Coded(e) => e.code(),
            StepError::Raw(f) => panic!("unexpected raw failure: {f}"),
        }
    }

    #[test]
    fn test_model_matching() {
        let available = vec!["llama2:latest".to_string(), "mistral:7b".to_string()];
        assert!(model_available(&available, "llama2"));
        assert!(model_available(&available, "llama2:latest"));
        assert!(model_available(&available, "mistral"));
        assert!(model_available(&available, "mistral:7b"));
        assert!(!model_available(&available, "mistral:latest"));
        assert!(!model_available(&available, "phi3"));

        let bare = vec!["codellama".to_string()];
        assert!(model_available(&bare, "codellama:latest"));
    }

    #[test]
    fn test_parse_model_list() {
        let output = "NAME            ID      SIZE    MODIFIED\n\
                      llama2:latest   abc123  3.8 GB  2 days ago\n\
                      mistral:7b      def456  4.1 GB  1 week ago\n";
        assert_eq!(parse_model_list(output), vec!["llama2:latest", "mistral:7b"]);
        assert!(parse_model_list("NAME ID SIZE MODIFIED\n").is_empty());
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let api = MockOllamaApi::unreachable();
        let runner = MockCommandRunner::new();
        let config = RuntimeConfig::default().ollama_enabled(false);
        verifier(api, runner.clone()).verify(&config).await.unwrap();
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let api = MockOllamaApi::new().with_models(["llama2:latest"]);
        let err = verifier(api, MockCommandRunner::new())
            .verify(&RuntimeConfig::default())
            .await
            .unwrap_err();
        let expected = if installable() { ErrorCode::Olm001 } else { ErrorCode::Olm005 };
        assert_eq!(code_of(err), expected);
    }

    #[tokio::test]
    async fn test_unreachable_is_olm_001() {
        let runner = MockCommandRunner::new().with_program("ollama");
        let err = verifier(MockOllamaApi::unreachable(), runner)
            .verify(&RuntimeConfig::default())
            .await
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::Olm001);
    }

    #[tokio::test]
    async fn test_missing_model_is_olm_002() {
        let runner = MockCommandRunner::new().with_program("ollama");
        let api = MockOllamaApi::new().with_models(["mistral:latest"]);
        let err = verifier(api, runner)
            .verify(&RuntimeConfig::default())
            .await
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::Olm002);
    }

    #[tokio::test]
    async fn test_verify_success() {
        let runner = MockCommandRunner::new().with_program("ollama");
        let api = MockOllamaApi::new().with_models(["llama2:latest"]);
        verifier(api, runner)
            .verify(&RuntimeConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_server_waits_and_reprobes() {
        let api = MockOllamaApi::unreachable();
        let started = api.clone();
        let runner = MockCommandRunner::new()
            .with_program("ollama")
            .with_hook("ollama serve", move |_| started.set_reachable(true));

        let verifier = verifier(api, runner.clone());
        verifier.ensure_running(&RuntimeConfig::default()).await.unwrap();
        assert_eq!(runner.get_method_calls("spawn_detached").len(), 1);
        assert!(!runner.was_called("install.sh"));
    }

    #[tokio::test]
    async fn test_list_models_prefers_cli() {
        let runner = MockCommandRunner::new()
            .with_program("ollama")
            .on("ollama list", MockResponse::success("NAME ID\nphi3:latest x\n"));
        let api = MockOllamaApi::new().with_models(["llama2:latest"]);
        assert_eq!(verifier(api.clone(), runner).list_models().await, vec!["phi3:latest"]);

        let no_cli = MockCommandRunner::new();
        assert_eq!(verifier(api, no_cli).list_models().await, vec!["llama2:latest"]);
    }

    #[test]
    fn test_client_takes_timeouts_from_config() {
        let mut config = RuntimeConfig::default().ollama;
        config.timeout_secs = 12;
        config.probe_timeout_secs = 1;
        config.pull_timeout_secs = 600;

        let client = OllamaClient::from_config(&config);
        assert_eq!(client.request_timeout, Duration::from_secs(12));
        assert_eq!(client.probe_timeout, Duration::from_secs(1));
        assert_eq!(client.pull_timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_failed_installer_download_stops_install() {
        if !installable() {
            return;
        }
        let runner = MockCommandRunner::new()
            .on("curl", MockResponse::failure(22, "curl: (22) The requested URL returned error: 404"));
        let err = verifier(MockOllamaApi::new(), runner.clone())
            .install()
            .await
            .unwrap_err();

        assert_eq!(code_of(err), ErrorCode::Olm005);
        assert_eq!(runner.get_method_calls("run").len(), 1);
        assert!(!runner.was_called("sh -c"));
    }

    #[tokio::test]
    async fn test_install_runs_downloaded_script() {
        if !installable() {
            return;
        }
        let runner = MockCommandRunner::new()
            .on("curl", MockResponse::success("#!/bin/sh\necho installing\n"));
        verifier(MockOllamaApi::new(), runner.clone())
            .install()
            .await
            .unwrap();

        let calls = runner.get_method_calls("run");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].command_line(), "sh -c '#!/bin/sh\necho installing\n'");
    }
}
