use async_trait::async_trait;
use lens_core::{ConfigPatch, CoreResult, ErrorCode, Remedy, RemedyOutcome, RuntimeConfig, SharedSink};
use lens_runner::{CommandSpec, ProcessResolver, SharedRunner};
use tracing::debug;

/// First port tried when moving the server off its configured address.
pub const FALLBACK_PORT_START: u16 = 8000;
/// Loopback host used for the retry.
pub const FALLBACK_HOST: &str = "127.0.0.1";

const FALLBACK_PORT_ATTEMPTS: u16 = 100;

/// `APP_001`: check the application imports cleanly, then retry on loopback
/// with a fresh port.
pub struct ImportCheck {
    runner: SharedRunner,
    resolver: ProcessResolver,
    sink: SharedSink,
}

impl ImportCheck {
    pub fn new(runner: SharedRunner, resolver: ProcessResolver, sink: SharedSink) -> Self {
        Self {
            runner,
            resolver,
            sink,
        }
    }

    fn import_script(config: &RuntimeConfig) -> String {
        format!(
            "import sys; sys.path.insert(0, '.'); from {} import create_app; create_app()",
            config.service.app_module
        )
    }
}

#[async_trait]
impl Remedy for ImportCheck {
    fn code(&self) -> ErrorCode {
        ErrorCode::App001
    }

    fn description(&self) -> &str {
        "Check the application imports and retry on a free loopback port"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        self.sink.info("Testing application import...");
        let spec = CommandSpec::new(config.venv_python())
            .arg("-c")
            .arg(Self::import_script(config))
            .cwd(config.backend_path());

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(e) => return Ok(RemedyOutcome::failed(format!("Could not run import check: {}", e))),
        };

        if !output.success() {
            self.sink.error("Application import failed");
            if !output.stdout.trim().is_empty() {
                self.sink.error(&format!("stdout: {}", output.stdout.trim()));
            }
            if !output.stderr.trim().is_empty() {
                self.sink.error(&format!("stderr: {}", output.stderr.trim()));
            }
            return Ok(RemedyOutcome::failed("Application failed to import"));
        }
        debug!("Application import succeeded");

        match self
            .resolver
            .find_free_port(FALLBACK_PORT_START, FALLBACK_PORT_ATTEMPTS)
            .await
        {
            Some(port) => {
                self.sink.info(&format!(
                    "Application imports cleanly, retrying on {}:{}",
                    FALLBACK_HOST, port
                ));
                Ok(RemedyOutcome::RetryWithChanges(
                    ConfigPatch::new().host(FALLBACK_HOST).port(port),
                ))
            }
            None => Ok(RemedyOutcome::failed(format!(
                "No free port found starting at {}",
                FALLBACK_PORT_START
            ))),
        }
    }
}
