//! One-shot operations behind the `stop`, `status` and `ollama` commands,
//! plus command-level recovery.

use std::collections::BTreeSet;
use std::fmt;

use lens_core::{DiagnosticsSink, RuntimeConfig, StepResult};
use serde::Serialize;
use tracing::debug;

use crate::error::{SupervisorError, SupervisorResult};
use crate::toolkit::Toolkit;

/// Stop whatever holds the service port, then every process matching the
/// service signature. Returns the pids that were terminated.
pub async fn terminate_instances(toolkit: &Toolkit, config: &RuntimeConfig) -> Vec<u32> {
    let resolver = &toolkit.resolver;
    let mut terminated = Vec::new();

    if let Some(pid) = resolver.find_owner_pid(config.port).await {
        toolkit.sink.info(&format!(
            "Found process {} using port {}, terminating",
            pid, config.port
        ));
        if resolver.terminate(pid).await {
            terminated.push(pid);
        }
    }

    for pid in resolver
        .find_service_processes(&config.service.signature)
        .await
    {
        if terminated.contains(&pid) {
            continue;
        }
        toolkit
            .sink
            .info(&format!("Terminating existing server process {}", pid));
        if resolver.terminate(pid).await {
            terminated.push(pid);
        }
    }

    debug!("Terminated {} process(es)", terminated.len());
    terminated
}

/// Result of `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub terminated: Vec<u32>,
    pub port_free: bool,
}

/// Stop every running instance and confirm the port is released.
pub async fn stop(toolkit: &Toolkit, config: &RuntimeConfig) -> SupervisorResult<StopReport> {
    toolkit.sink.info("Stopping LogicLens application...");
    let terminated = terminate_instances(toolkit, config).await;

    if terminated.is_empty() {
        toolkit.sink.info("No running LogicLens processes found");
    }

    if toolkit.resolver.is_port_in_use(config.port).await {
        toolkit.sink.warn(&format!(
            "Port {} is still in use after cleanup",
            config.port
        ));
        return Err(SupervisorError::PortStillInUse(config.port));
    }

    toolkit.sink.success("LogicLens application stopped");
    Ok(StopReport {
        terminated,
        port_free: true,
    })
}

/// How a running process was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessSource {
    /// Owns the service port.
    Port,
    /// Matched the service signature.
    Process,
}

impl fmt::Display for ProcessSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port => f.write_str("port"),
            Self::Process => f.write_str("process"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceProcess {
    pub pid: u32,
    pub source: ProcessSource,
}

/// Result of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub system: String,
    pub port: u16,
    pub port_in_use: bool,
    pub processes: Vec<ServiceProcess>,
    pub venv_exists: bool,
    pub python_version: Option<String>,
}

impl StatusReport {
    pub fn running(&self) -> bool {
        !self.processes.is_empty()
    }

    pub fn log_to(&self, sink: &dyn DiagnosticsSink) {
        sink.info("===== LogicLens Status =====");
        sink.info(&format!("System: {}", self.system));

        if self.port_in_use {
            sink.info(&format!("Port {}: In use", self.port));
        } else {
            sink.info(&format!("Port {}: Available", self.port));
        }

        if self.running() {
            sink.success("LogicLens is running");
            for process in &self.processes {
                sink.info(&format!("  PID {} (found by {})", process.pid, process.source));
            }
        } else {
            sink.info("LogicLens is not running");
        }

        if self.venv_exists {
            sink.info("Virtual environment: Found");
            match &self.python_version {
                Some(version) => sink.info(&format!("Python version: {}", version)),
                None => sink.warn("Python version: unknown"),
            }
        } else {
            sink.warn("Virtual environment: Not found");
        }
        sink.info("============================");
    }
}

/// Collect the current state of the service without changing anything.
pub async fn status(toolkit: &Toolkit, config: &RuntimeConfig) -> StatusReport {
    let resolver = &toolkit.resolver;
    let port_in_use = resolver.is_port_in_use(config.port).await;

    let mut seen = BTreeSet::new();
    let mut processes = Vec::new();
    if let Some(pid) = resolver.find_owner_pid(config.port).await {
        seen.insert(pid);
        processes.push(ServiceProcess {
            pid,
            source: ProcessSource::Port,
        });
    }
    for pid in resolver
        .find_service_processes(&config.service.signature)
        .await
    {
        if seen.insert(pid) {
            processes.push(ServiceProcess {
                pid,
                source: ProcessSource::Process,
            });
        }
    }

    let venv_exists = config.venv_path().exists();
    let python_version = if venv_exists {
        let python = config.venv_python();
        toolkit
            .provisioner
            .interpreter_version(&python.to_string_lossy())
            .await
            .map(|v| v.to_string())
    } else {
        None
    };

    StatusReport {
        system: resolver.platform().to_string(),
        port: config.port,
        port_in_use,
        processes,
        venv_exists,
        python_version,
    }
}

/// Log the inference backend settings.
pub fn show_ollama_config(toolkit: &Toolkit, config: &RuntimeConfig) {
    let sink = &toolkit.sink;
    sink.info("Ollama Configuration:");
    sink.info(&format!("  Host: {}", config.ollama.host));
    sink.info(&format!("  Model: {}", config.ollama.model));
    sink.info(&format!("  Enabled: {}", config.ollama.enabled));
    sink.info("Use --help for available options");
}

/// Log and return the locally available models.
pub async fn list_models(toolkit: &Toolkit) -> Vec<String> {
    let models = toolkit.verifier.list_models().await;
    if models.is_empty() {
        toolkit.sink.warn("No models available or Ollama not running");
    } else {
        toolkit.sink.info("Available models:");
        for model in &models {
            toolkit.sink.info(&format!("  - {}", model));
        }
    }
    models
}

/// Persist a new host and/or model into the `.env` file and the config.
pub fn configure_ollama(
    toolkit: &Toolkit,
    config: &mut RuntimeConfig,
    host: Option<&str>,
    model: Option<&str>,
) -> StepResult<()> {
    toolkit
        .provisioner
        .update_external_config(config, host, model)?;
    if let Some(host) = host {
        config.ollama.host = host.to_string();
    }
    if let Some(model) = model {
        config.ollama.model = model.to_string();
    }
    Ok(())
}

/// Last-chance recovery for an error that escaped a command.
///
/// Errors the orchestrator already reported are left alone. Returns whether
/// a remedy ran and succeeded; the command itself is not retried.
pub async fn recover_command(
    toolkit: &Toolkit,
    config: &RuntimeConfig,
    command: &str,
    error: &SupervisorError,
) -> bool {
    if error.is_reported() {
        return false;
    }

    toolkit
        .sink
        .error("An error occurred. Attempting recovery...");
    let context = format!("Command: {}", command);
    let classifier = toolkit.classifier(config);
    let lens_error = match error {
        SupervisorError::Step(step) => classifier.resolve(step, Some(&context)),
        other => classifier.classify(&other.to_failure(), Some(&context)),
    };

    let dispatcher = toolkit.dispatcher();
    let outcome = dispatcher.handle(&lens_error, Some(&context), config).await;
    if outcome.recovered() {
        toolkit
            .sink
            .success("Recovery was successful. Please try your command again.");
        true
    } else {
        toolkit
            .sink
            .error("Recovery was not successful. Please check the logs and try again.");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lens_core::{MemorySink, Severity};
    use lens_runner::{MockCommandRunner, MockOllamaApi, MockPortProbe, MockProcessTable, PortProbe};

    fn toolkit(table: MockProcessTable, probe: MockPortProbe, sink: &MemorySink) -> Toolkit {
        Toolkit::new(
            &RuntimeConfig::default(),
            Arc::new(MockCommandRunner::new()),
            Arc::new(table),
            Arc::new(probe),
            Arc::new(MockOllamaApi::new()),
            Arc::new(sink.clone()),
        )
    }

    #[tokio::test]
    async fn test_terminate_instances_skips_port_owner_duplicate() {
        let probe = MockPortProbe::new();
        let table = MockProcessTable::new()
            .linked_to(&probe)
            .with_owner(5050, 4242)
            .with_process(4242, "python -m flask run --port 5050")
            .with_process(4300, "python -m flask run --port 6000")
            .with_process(4400, "bash");
        let sink = MemorySink::new();
        let toolkit = toolkit(table.clone(), probe.clone(), &sink);

        let terminated = terminate_instances(&toolkit, &RuntimeConfig::default()).await;
        assert_eq!(terminated, vec![4242, 4300]);
        assert_eq!(table.terminated(), vec![4242, 4300]);
        assert!(!probe.is_in_use(5050).await);
    }

    #[tokio::test]
    async fn test_terminate_instances_leaves_unrelated_processes() {
        let probe = MockPortProbe::new();
        let supervisor = std::process::id();
        let table = MockProcessTable::new()
            .linked_to(&probe)
            .with_process(4310, "vim logiclens.toml")
            .with_process(4311, "tail -f /var/log/logiclens/app.log")
            .with_process(4312, "sudo logiclens stop")
            .with_process(4320, "python3 scripts/dev.py flask run")
            .with_process_under(supervisor, 4320, "target/debug/logiclens stop")
            .with_process(4330, "python -m flask run --port 5050");
        let sink = MemorySink::new();
        let toolkit = toolkit(table.clone(), probe, &sink);

        let terminated = terminate_instances(&toolkit, &RuntimeConfig::default()).await;
        assert_eq!(terminated, vec![4330]);
        assert_eq!(table.terminated(), vec![4330]);
    }

    #[tokio::test]
    async fn test_stop_fails_when_port_stays_busy() {
        let probe = MockPortProbe::new().with_busy([5050]);
        let sink = MemorySink::new();
        let toolkit = toolkit(MockProcessTable::new(), probe, &sink);

        let err = stop(&toolkit, &RuntimeConfig::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortStillInUse(5050)));
        assert_eq!(
            sink.count(Severity::Warning, "Port 5050 is still in use after cleanup"),
            1
        );
    }

    #[tokio::test]
    async fn test_status_lists_each_pid_once() {
        let probe = MockPortProbe::new();
        let table = MockProcessTable::new()
            .linked_to(&probe)
            .with_owner(5050, 4242)
            .with_process(4242, "python -m flask run")
            .with_process(4300, "/srv/backend/venv/bin/flask run --port 5050");
        let sink = MemorySink::new();
        let toolkit = toolkit(table, probe, &sink);

        let report = status(&toolkit, &RuntimeConfig::default()).await;
        assert!(report.port_in_use);
        assert!(report.running());
        assert_eq!(
            report.processes,
            vec![
                ServiceProcess { pid: 4242, source: ProcessSource::Port },
                ServiceProcess { pid: 4300, source: ProcessSource::Process },
            ]
        );

        report.log_to(&sink);
        assert!(sink.contains("===== LogicLens Status ====="));
        assert!(sink.contains("Port 5050: In use"));
        assert!(sink.contains("PID 4300 (found by process)"));
    }

    #[tokio::test]
    async fn test_reported_errors_are_not_recovered_again() {
        let sink = MemorySink::new();
        let toolkit = toolkit(MockProcessTable::new(), MockPortProbe::new(), &sink);

        let recovered = recover_command(
            &toolkit,
            &RuntimeConfig::default(),
            "start",
            &SupervisorError::Interrupted,
        )
        .await;
        assert!(!recovered);
        assert!(sink.entries().is_empty());
    }
}
