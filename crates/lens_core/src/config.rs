//! Runtime configuration shared by every supervisor component.
//!
//! The configuration is owned by the orchestrator and handed to components
//! by reference. Remediations never write it directly; they return a
//! [`ConfigPatch`] that the orchestrator merges before retrying a step.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Settings for the supervised server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Short name used in context strings and logs.
    pub name: String,
    /// Python package exposing the application factory.
    pub app_module: String,
    /// Command-line fragments identifying a running server. Only Python
    /// interpreters and the `flask` entry point are matched against them.
    pub signature: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "flask".to_string(),
            app_module: "app".to_string(),
            signature: vec!["flask run".to_string()],
        }
    }
}

/// Settings for the external inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
    pub enabled: bool,
    /// Abort the run when the backend cannot be verified.
    pub required: bool,
    pub verify_on_startup: bool,
    /// Timeout for API requests such as listing models, in seconds.
    pub timeout_secs: u64,
    /// Timeout for health probes, in seconds.
    pub probe_timeout_secs: u64,
    /// Timeout for a model download, in seconds.
    pub pull_timeout_secs: u64,
    /// How long to wait after starting the backend before re-probing.
    pub settle_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "llama2".to_string(),
            enabled: true,
            required: false,
            verify_on_startup: true,
            timeout_secs: 30,
            probe_timeout_secs: 3,
            pull_timeout_secs: 3600,
            settle_secs: 5,
        }
    }
}

impl OllamaConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

/// Delays used around process handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait between a graceful and a forceful kill.
    pub terminate_grace_secs: u64,
    /// Wait before re-checking a port after freeing it.
    pub port_settle_secs: u64,
    /// Wait after spawning the server before checking it is alive.
    pub launch_settle_secs: u64,
    /// Bounded wait for the server to exit on shutdown.
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            terminate_grace_secs: 2,
            port_settle_secs: 2,
            launch_settle_secs: 2,
            shutdown_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn port_settle(&self) -> Duration {
        Duration::from_secs(self.port_settle_secs)
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_secs(self.launch_settle_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

/// The complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    /// Project root; relative paths below resolve against it.
    pub project_dir: PathBuf,
    /// Environment root holding the server sources.
    pub backend_dir: PathBuf,
    /// Isolated environment directory, relative to `backend_dir`.
    pub venv_dir: PathBuf,
    /// Minimum interpreter version, e.g. `3.8`.
    pub python_version: String,
    /// Dependency manifest, relative to `backend_dir`.
    pub requirements_file: String,
    pub env_file: String,
    pub env_template: String,
    /// Python snippet run by the `test` command to seed sample data.
    pub seed_script: Option<String>,
    pub service: ServiceConfig,
    pub ollama: OllamaConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5050,
            debug: true,
            project_dir: PathBuf::from("."),
            backend_dir: PathBuf::from("backend"),
            venv_dir: PathBuf::from("venv"),
            python_version: "3.8".to_string(),
            requirements_file: "requirements.txt".to_string(),
            env_file: ".env".to_string(),
            env_template: ".env.example".to_string(),
            seed_script: None,
            service: ServiceConfig::default(),
            ollama: OllamaConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration file name looked up in the working directory.
    pub const FILE_NAME: &'static str = "logiclens.toml";

    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| CoreError::InvalidConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load an explicit file, or `logiclens.toml` from `dir` if present,
    /// falling back to defaults.
    pub fn discover(explicit: Option<&Path>, dir: impl AsRef<Path>) -> CoreResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = dir.as_ref().join(Self::FILE_NAME);
        if candidate.exists() {
            info!("Using configuration file {:?}", candidate);
            Self::load(candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    pub fn ollama_enabled(mut self, enabled: bool) -> Self {
        self.ollama.enabled = enabled;
        self
    }

    /// Absolute-or-relative path of the environment root.
    pub fn backend_path(&self) -> PathBuf {
        self.project_dir.join(&self.backend_dir)
    }

    pub fn venv_path(&self) -> PathBuf {
        self.backend_path().join(&self.venv_dir)
    }

    /// `bin` on POSIX-like systems, `Scripts` on Windows.
    pub fn venv_bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_path().join("Scripts")
        } else {
            self.venv_path().join("bin")
        }
    }

    pub fn venv_python(&self) -> PathBuf {
        self.venv_bin_dir().join(executable_name("python"))
    }

    pub fn venv_pip(&self) -> PathBuf {
        self.venv_bin_dir().join(executable_name("pip"))
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.backend_path().join(&self.requirements_file)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.backend_path().join(&self.env_file)
    }

    pub fn env_template_path(&self) -> PathBuf {
        self.backend_path().join(&self.env_template)
    }

    /// Merge a remediation patch into this configuration.
    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(host) = &patch.host {
            info!("Configuration change: host {} -> {}", self.host, host);
            self.host = host.clone();
        }
        if let Some(port) = patch.port {
            info!("Configuration change: port {} -> {}", self.port, port);
            self.port = port;
        }
        if let Some(enabled) = patch.ollama_enabled {
            info!("Configuration change: ollama enabled -> {}", enabled);
            self.ollama.enabled = enabled;
        }
    }
}

/// Platform-specific executable file name.
pub fn executable_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

/// A set of configuration changes proposed by a remediation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ollama_enabled: Option<bool>,
}

impl ConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn ollama_enabled(mut self, enabled: bool) -> Self {
        self.ollama_enabled = Some(enabled);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.ollama_enabled.is_none()
    }
}
