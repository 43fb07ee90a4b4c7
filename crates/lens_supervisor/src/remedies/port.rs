use async_trait::async_trait;
use lens_core::{ConfigPatch, CoreResult, ErrorCode, Remedy, RemedyOutcome, RuntimeConfig, SharedSink};
use lens_runner::ProcessResolver;

/// How many ports past the configured one are tried.
const PORT_SCAN_LIMIT: u16 = 100;

/// `PRC_001`: free the configured port, or move to the next free one.
pub struct FreePort {
    resolver: ProcessResolver,
    sink: SharedSink,
}

impl FreePort {
    pub fn new(resolver: ProcessResolver, sink: SharedSink) -> Self {
        Self { resolver, sink }
    }
}

#[async_trait]
impl Remedy for FreePort {
    fn code(&self) -> ErrorCode {
        ErrorCode::Prc001
    }

    fn description(&self) -> &str {
        "Free the port or pick another one"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        let port = config.port;

        if let Some(pid) = self.resolver.find_owner_pid(port).await {
            self.sink
                .info(&format!("Found process {} using port {}, attempting to terminate", pid, port));
            if self.resolver.terminate(pid).await {
                tokio::time::sleep(config.timeouts.port_settle()).await;
            }
        }

        // The holder may have exited on its own since the step failed.
        if !self.resolver.is_port_in_use(port).await {
            self.sink.success(&format!("Port {} is now available", port));
            return Ok(RemedyOutcome::Recovered);
        }

        let next = port.saturating_add(1);
        match self.resolver.find_free_port(next, PORT_SCAN_LIMIT).await {
            Some(free) => {
                self.sink
                    .info(&format!("Using alternative port {} instead of {}", free, port));
                Ok(RemedyOutcome::recovered_with(ConfigPatch::new().port(free)))
            }
            None => Ok(RemedyOutcome::failed(format!(
                "No free port found between {} and {}",
                next,
                next.saturating_add(PORT_SCAN_LIMIT - 1)
            ))),
        }
    }
}
