//! Remedies for the isolated environment and its configuration file.

use std::sync::Arc;

use async_trait::async_trait;
use lens_core::{CoreResult, ErrorCode, Remedy, RemedyOutcome, RuntimeConfig, SharedSink};
use lens_runner::EnvironmentProvisioner;

/// `DEP_001`: rebuild the environment so that pip exists again.
pub struct RecreateEnvironment {
    provisioner: Arc<EnvironmentProvisioner>,
}

impl RecreateEnvironment {
    pub fn new(provisioner: Arc<EnvironmentProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Remedy for RecreateEnvironment {
    fn code(&self) -> ErrorCode {
        ErrorCode::Dep001
    }

    fn description(&self) -> &str {
        "Recreate the virtual environment"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        Ok(match self.provisioner.recreate_environment(config).await {
            Ok(_) => RemedyOutcome::Recovered,
            Err(e) => RemedyOutcome::failed(e.to_string()),
        })
    }
}

/// `DEP_002`: upgrade pip before the install is retried.
pub struct UpgradeInstaller {
    provisioner: Arc<EnvironmentProvisioner>,
}

impl UpgradeInstaller {
    pub fn new(provisioner: Arc<EnvironmentProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Remedy for UpgradeInstaller {
    fn code(&self) -> ErrorCode {
        ErrorCode::Dep002
    }

    fn description(&self) -> &str {
        "Upgrade pip in the virtual environment"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        Ok(match self.provisioner.upgrade_installer(config).await {
            Ok(()) => RemedyOutcome::Recovered,
            Err(e) => RemedyOutcome::failed(e.to_string()),
        })
    }
}

/// `ENV_002`: create the environment with `virtualenv` instead of `venv`.
pub struct VirtualenvFallback {
    provisioner: Arc<EnvironmentProvisioner>,
    sink: SharedSink,
}

impl VirtualenvFallback {
    pub fn new(provisioner: Arc<EnvironmentProvisioner>, sink: SharedSink) -> Self {
        Self { provisioner, sink }
    }
}

#[async_trait]
impl Remedy for VirtualenvFallback {
    fn code(&self) -> ErrorCode {
        ErrorCode::Env002
    }

    fn description(&self) -> &str {
        "Create the virtual environment with virtualenv"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        match self.provisioner.create_with_virtualenv(config).await {
            Ok(_) => Ok(RemedyOutcome::Recovered),
            Err(e) => {
                self.sink.warn(&format!("Failed to create virtual environment with virtualenv: {}", e));
                self.sink.warn(
                    "Cannot continue without a virtual environment, install the venv or virtualenv module and retry",
                );
                Ok(RemedyOutcome::failed(e.to_string()))
            }
        }
    }
}

/// `CFG_002`: write the local configuration file from built-in defaults.
pub struct WriteDefaultConfig {
    provisioner: Arc<EnvironmentProvisioner>,
}

impl WriteDefaultConfig {
    pub fn new(provisioner: Arc<EnvironmentProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Remedy for WriteDefaultConfig {
    fn code(&self) -> ErrorCode {
        ErrorCode::Cfg002
    }

    fn description(&self) -> &str {
        "Write .env from built-in defaults"
    }

    async fn apply(&self, config: &RuntimeConfig, _context: Option<&str>) -> CoreResult<RemedyOutcome> {
        Ok(match self.provisioner.write_default_config(config) {
            Ok(_) => RemedyOutcome::Recovered,
            Err(e) => RemedyOutcome::failed(e.to_string()),
        })
    }
}
