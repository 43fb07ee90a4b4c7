//! Isolated environment provisioning.
//!
//! Creates the Python virtual environment, installs the backend's declared
//! dependencies, and keeps the backend's `.env` file in shape. Failures are
//! returned as [`StepError`]s: some already coded, most raw so that the
//! orchestrator's classifier can map them using the step context.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use lens_core::{ErrorCode, Failure, RuntimeConfig, SharedSink, StepError, StepResult};
use regex::Regex;
use tracing::debug;

use crate::command::{CommandSpec, SharedRunner};

/// Key holding the inference backend URL in the `.env` file.
pub const OLLAMA_HOST_KEY: &str = "OLLAMA_HOST";
/// Key holding the inference model name in the `.env` file.
pub const OLLAMA_MODEL_KEY: &str = "OLLAMA_MODEL";

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// An interpreter version as printed by `python --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl PythonVersion {
    /// Parse `Python 3.11.4` style output.
    pub fn parse(output: &str) -> Option<Self> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = RE
            .get_or_init(|| Regex::new(r"Python\s+(\d+)\.(\d+)(?:\.(\d+))?").ok())
            .as_ref()?;
        let caps = re.captures(output)?;
        Some(Self {
            major: caps.get(1)?.as_str().parse().ok()?,
            minor: caps.get(2)?.as_str().parse().ok()?,
            patch: caps.get(3).and_then(|m| m.as_str().parse().ok()),
        })
    }

    /// Parse a `3.8` style requirement.
    pub fn requirement(spec: &str) -> Option<(u32, u32)> {
        let mut parts = spec.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        Some((major, minor))
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

/// What `materialize_config` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFileStatus {
    AlreadyPresent,
    CreatedFromTemplate,
}

/// Rewrite or append `KEY=value` lines.
///
/// Existing lines for a key are replaced when a value is given and kept
/// otherwise; keys with a value that are missing are appended.
pub fn upsert_env_lines(content: &str, updates: &[(&str, Option<&str>)]) -> String {
    let mut seen = vec![false; updates.len()];
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            for (i, (key, value)) in updates.iter().enumerate() {
                if trimmed.starts_with(&format!("{}=", key)) {
                    seen[i] = true;
                    if let Some(value) = value {
                        return format!("{}={}", key, value);
                    }
                }
            }
            line.to_string()
        })
        .collect();

    for (i, (key, value)) in updates.iter().enumerate() {
        if let (false, Some(value)) = (seen[i], value) {
            lines.push(format!("{}={}", key, value));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Creates and maintains the isolated environment.
pub struct EnvironmentProvisioner {
    runner: SharedRunner,
    sink: SharedSink,
}

impl EnvironmentProvisioner {
    pub fn new(runner: SharedRunner, sink: SharedSink) -> Self {
        Self { runner, sink }
    }

    /// Fail with `ENV_004` when the environment root is missing.
    pub fn check_backend(&self, config: &RuntimeConfig) -> StepResult<()> {
        if config.backend_path().is_dir() {
            Ok(())
        } else {
            Err(StepError::coded(
                ErrorCode::Env004,
                format!(
                    "Backend directory '{}' not found. Are you in the project root?",
                    config.backend_dir.display()
                ),
            ))
        }
    }

    fn python_candidates(config: &RuntimeConfig) -> Vec<String> {
        let version = config.python_version.trim();
        let minor = version.rsplit('.').next().unwrap_or(version);
        let mut candidates = vec![
            format!("python{}", version),
            format!("python3.{}", minor),
            "python3".to_string(),
            "python".to_string(),
        ];
        candidates.dedup();
        candidates
    }

    /// Installed interpreter version of `program`, if it runs.
    pub async fn interpreter_version(&self, program: &str) -> Option<PythonVersion> {
        let spec = CommandSpec::new(program)
            .arg("--version")
            .timeout(VERSION_TIMEOUT);
        let output = self.runner.run(&spec).await.ok()?;
        if !output.success() {
            return None;
        }
        PythonVersion::parse(&output.combined_output())
    }

    /// Locate an interpreter satisfying the configured minimum version.
    pub async fn find_python(&self, config: &RuntimeConfig) -> StepResult<String> {
        let (major, minor) = PythonVersion::requirement(&config.python_version).unwrap_or((3, 8));
        for candidate in Self::python_candidates(config) {
            match self.interpreter_version(&candidate).await {
                Some(version) if version.at_least(major, minor) => {
                    debug!("Using {} (Python {})", candidate, version);
                    return Ok(candidate);
                }
                Some(version) => debug!("{} is Python {}, too old", candidate, version),
                None => debug!("{} not usable", candidate),
            }
        }
        Err(StepError::coded(
            ErrorCode::Env001,
            format!(
                "Could not find a suitable Python interpreter ({}.{}+)",
                major, minor
            ),
        ))
    }

    /// Create the environment unless it already exists.
    pub async fn ensure_environment(&self, config: &RuntimeConfig) -> StepResult<PathBuf> {
        let venv = config.venv_path();
        if venv.exists() {
            self.sink
                .info(&format!("Virtual environment already exists at {}", venv.display()));
            return Ok(venv);
        }

        self.sink.info(&format!(
            "Creating virtual environment with Python {}...",
            config.python_version
        ));
        let python = self.find_python(config).await?;
        self.create_with(&python, "venv", config).await?;
        self.sink.success("Virtual environment created successfully");
        Ok(venv)
    }

    /// Delete the environment and create it again, verifying pip is present.
    pub async fn recreate_environment(&self, config: &RuntimeConfig) -> StepResult<PathBuf> {
        let venv = config.venv_path();
        if venv.exists() {
            self.sink.info(&format!(
                "Removing broken virtual environment at {}",
                venv.display()
            ));
            fs::remove_dir_all(&venv)?;
        }

        self.sink.info("Creating a new virtual environment");
        let python = self.find_python(config).await?;
        self.create_with(&python, "venv", config).await?;

        let pip = config.venv_pip();
        if !pip.exists() {
            return Err(StepError::Raw(Failure::not_found(format!(
                "pip still not found at {} after recreating virtual environment",
                pip.display()
            ))));
        }
        self.sink
            .success("Virtual environment recreated successfully with pip");
        Ok(venv)
    }

    /// Create the environment with the `virtualenv` tool, installing it first.
    pub async fn create_with_virtualenv(&self, config: &RuntimeConfig) -> StepResult<PathBuf> {
        let python = self.find_python(config).await?;

        let install = CommandSpec::new(&python).args(["-m", "pip", "install", "virtualenv"]);
        match self.runner.run(&install).await {
            Ok(output) if output.success() => self.sink.info("Installed virtualenv"),
            _ => self
                .sink
                .warn("Failed to install virtualenv, continuing with standard venv"),
        }

        self.create_with(&python, "virtualenv", config).await?;
        self.sink
            .success("Virtual environment created successfully with virtualenv");
        Ok(config.venv_path())
    }

    async fn create_with(&self, python: &str, module: &str, config: &RuntimeConfig) -> StepResult<()> {
        let spec = CommandSpec::new(python)
            .args(["-m", module])
            .arg(config.venv_path());
        self.runner.run(&spec).await?.check(python)?;
        Ok(())
    }

    /// Install the backend's dependencies into the environment.
    pub async fn install_dependencies(&self, config: &RuntimeConfig) -> StepResult<()> {
        let pip = config.venv_pip();
        if !pip.exists() {
            return Err(StepError::Raw(Failure::not_found(format!(
                "pip not found at {}",
                pip.display()
            ))));
        }

        let requirements = config.requirements_path();
        if requirements.exists() {
            self.sink.info(&format!(
                "Installing requirements from {}...",
                requirements.display()
            ));
            let spec = CommandSpec::new(&pip)
                .args(["install", "-r"])
                .arg(&requirements);
            self.runner.run(&spec).await?.check("pip install")?;
            self.sink.success("Dependencies installed successfully");
        } else {
            self.sink.info("Installing package in development mode...");
            let spec = CommandSpec::new(&pip)
                .args(["install", "-e", "."])
                .cwd(&config.project_dir);
            let output = self.runner.run(&spec).await?;
            if !output.success() {
                return Err(StepError::coded(
                    ErrorCode::Dep004,
                    output.combined_output().trim().to_string(),
                ));
            }
            self.sink.success("Package installed in development mode");
        }
        Ok(())
    }

    /// Upgrade pip inside the environment.
    pub async fn upgrade_installer(&self, config: &RuntimeConfig) -> StepResult<()> {
        let python = config.venv_python();
        let spec = CommandSpec::new(&python).args(["-m", "pip", "install", "--upgrade", "pip"]);
        self.runner.run(&spec).await?.check("pip upgrade")?;
        self.sink.info("Upgraded pip in the virtual environment");
        Ok(())
    }

    /// Create the local `.env` file from its template if it is missing, then
    /// make sure the inference backend keys are present.
    pub fn materialize_config(&self, config: &RuntimeConfig) -> StepResult<ConfigFileStatus> {
        let env_file = config.env_file_path();
        let status = if env_file.exists() {
            self.sink.info(&format!("{} file already exists", config.env_file));
            ConfigFileStatus::AlreadyPresent
        } else {
            let template = config.env_template_path();
            if !template.exists() {
                return Err(StepError::coded(
                    ErrorCode::Cfg002,
                    format!("{} not found", template.display()),
                ));
            }
            self.sink
                .info(&format!("Creating {} file from example...", config.env_file));
            fs::copy(&template, &env_file).map_err(|e| {
                StepError::coded(ErrorCode::Cfg001, format!("{}: {}", env_file.display(), e))
            })?;
            self.sink.success(&format!("{} file created", config.env_file));
            self.sink.warn(&format!(
                "You may want to review and update the {} file with your configuration",
                config.env_file
            ));
            ConfigFileStatus::CreatedFromTemplate
        };

        self.append_missing_keys(config)?;
        Ok(status)
    }

    fn append_missing_keys(&self, config: &RuntimeConfig) -> StepResult<()> {
        let env_file = config.env_file_path();
        let content = fs::read_to_string(&env_file)?;
        let has_key = |key: &str| {
            content
                .lines()
                .any(|l| l.trim_start().starts_with(&format!("{}=", key)))
        };
        let host = (!has_key(OLLAMA_HOST_KEY)).then_some(config.ollama.host.as_str());
        let model = (!has_key(OLLAMA_MODEL_KEY)).then_some(config.ollama.model.as_str());
        if host.is_none() && model.is_none() {
            return Ok(());
        }

        let updated = upsert_env_lines(&content, &[(OLLAMA_HOST_KEY, host), (OLLAMA_MODEL_KEY, model)]);
        fs::write(&env_file, updated)
            .map_err(|e| StepError::coded(ErrorCode::Cfg001, format!("{}: {}", env_file.display(), e)))?;
        debug!("Appended missing inference backend keys to {}", env_file.display());
        Ok(())
    }

    /// Write a fresh `.env` file from built-in defaults. Never overwrites.
    pub fn write_default_config(&self, config: &RuntimeConfig) -> StepResult<PathBuf> {
        let env_file = config.env_file_path();
        if env_file.exists() {
            return Ok(env_file);
        }
        let content = format!(
            "# Local LogicLens configuration\n{}={}\n{}={}\n",
            OLLAMA_HOST_KEY, config.ollama.host, OLLAMA_MODEL_KEY, config.ollama.model
        );
        fs::write(&env_file, content)
            .map_err(|e| StepError::coded(ErrorCode::Cfg001, format!("{}: {}", env_file.display(), e)))?;
        self.sink.success(&format!(
            "Created {} from built-in defaults",
            env_file.display()
        ));
        Ok(env_file)
    }

    /// Persist the inference backend host and model into the `.env` file.
    pub fn update_external_config(
        &self,
        config: &RuntimeConfig,
        host: Option<&str>,
        model: Option<&str>,
    ) -> StepResult<()> {
        let env_file = config.env_file_path();
        if !env_file.exists() {
            let template = config.env_template_path();
            if !template.exists() {
                return Err(StepError::coded(
                    ErrorCode::Cfg002,
                    format!("{} not found", template.display()),
                ));
            }
            self.sink
                .info(&format!("Creating {} file from example...", config.env_file));
            fs::copy(&template, &env_file)?;
        }

        let content = fs::read_to_string(&env_file)?;
        let updated = upsert_env_lines(&content, &[(OLLAMA_HOST_KEY, host), (OLLAMA_MODEL_KEY, model)]);
        fs::write(&env_file, updated)?;
        self.sink.success("Ollama configuration updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommandRunner, MockResponse};
    use lens_core::MemorySink;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn provisioner(runner: MockCommandRunner) -> (EnvironmentProvisioner, MemorySink) {
        let sink = MemorySink::new();
        (
            EnvironmentProvisioner::new(Arc::new(runner), Arc::new(sink.clone())),
            sink,
        )
    }

    fn project() -> (TempDir, RuntimeConfig) {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("backend")).unwrap();
        let config = RuntimeConfig::default().project_dir(temp_dir.path());
        (temp_dir, config)
    }

    #[test]
    fn test_python_version_parse() {
        let v = PythonVersion::parse("Python 3.11.4\n").unwrap();
        assert_eq!(v.to_string(), "3.11.4");
        assert!(v.at_least(3, 8));
        assert!(!PythonVersion::parse("Python 3.7").unwrap().at_least(3, 8));
        assert!(PythonVersion::parse("command not found").is_none());
        assert_eq!(PythonVersion::requirement("3.8"), Some((3, 8)));
    }

    #[test]
    fn test_upsert_env_lines() {
        let content = "DEBUG=1\nOLLAMA_HOST=http://old:11434\n";
        let updated = upsert_env_lines(content, &[("OLLAMA_HOST", Some("http://new:11434")), ("OLLAMA_MODEL", Some("mistral"))]);
        assert_eq!(updated, "DEBUG=1\nOLLAMA_HOST=http://new:11434\nOLLAMA_MODEL=mistral\n");

        let kept = upsert_env_lines(content, &[("OLLAMA_HOST", None)]);
        assert_eq!(kept, content);
    }

    #[tokio::test]
    async fn test_find_python_skips_old_and_missing() {
        let (_dir, config) = project();
        let runner = MockCommandRunner::new()
            .on("python3.8 --version", MockResponse::not_found())
            .on("python3 --version", MockResponse::success("Python 3.6.9"))
            .on("python --version", MockResponse::success("Python 3.10.2"));
        let (provisioner, _) = provisioner(runner);
        assert_eq!(provisioner.find_python(&config).await.unwrap(), "python");
    }

    #[tokio::test]
    async fn test_find_python_none_suitable_is_env_001() {
        let (_dir, config) = project();
        let runner = MockCommandRunner::new().on("--version", MockResponse::not_found());
        let (provisioner, _) = provisioner(runner);
        match provisioner.find_python(&config).await.unwrap_err() {
            StepError::Coded(e) => assert_eq!(e.code(), ErrorCode::Env001),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ensure_environment_is_noop_when_present() {
        let (_dir, config) = project();
        fs::create_dir_all(config.venv_path()).unwrap();
        let runner = MockCommandRunner::new();
        let (provisioner, sink) = provisioner(runner.clone());

        provisioner.ensure_environment(&config).await.unwrap();
        assert_eq!(runner.call_count(), 0);
        assert!(sink.contains("Virtual environment already exists"));
    }

    #[tokio::test]
    async fn test_venv_failure_is_raw_subprocess() {
        let (_dir, config) = project();
        let runner = MockCommandRunner::new()
            .on("--version", MockResponse::success("Python 3.12.1"))
            .on("-m venv", MockResponse::failure(1, "ensurepip is not available"));
        let (provisioner, _) = provisioner(runner);
        match provisioner.ensure_environment(&config).await.unwrap_err() {
            StepError::Raw(f) => {
                assert_eq!(f.kind, lens_core::FailureKind::Subprocess);
                assert!(f.message.contains("ensurepip"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_pip_is_not_found() {
        let (_dir, config) = project();
        let (provisioner, _) = provisioner(MockCommandRunner::new());
        match provisioner.install_dependencies(&config).await.unwrap_err() {
            StepError::Raw(f) => {
                assert_eq!(f.kind, lens_core::FailureKind::NotFound);
                assert!(f.message.contains("pip"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_install_prefers_requirements_file() {
        let (_dir, config) = project();
        fs::create_dir_all(config.venv_bin_dir()).unwrap();
        fs::write(config.venv_pip(), "").unwrap();
        fs::write(config.requirements_path(), "flask\n").unwrap();

        let runner = MockCommandRunner::new();
        let (provisioner, _) = provisioner(runner.clone());
        provisioner.install_dependencies(&config).await.unwrap();
        assert!(runner.was_called("install -r"));

        fs::remove_file(config.requirements_path()).unwrap();
        provisioner.install_dependencies(&config).await.unwrap();
        let calls = runner.get_calls();
        let dev = calls.last().unwrap();
        assert!(dev.command_line().ends_with("install -e ."));
        assert_eq!(dev.spec.cwd.as_ref(), Some(&config.project_dir));
    }

    #[test]
    fn test_materialize_never_overwrites_and_appends_keys() {
        let (_dir, config) = project();
        fs::write(config.env_file_path(), "SECRET=keep\nOLLAMA_MODEL=mistral\n").unwrap();
        let (provisioner, _) = provisioner(MockCommandRunner::new());

        let status = provisioner.materialize_config(&config).unwrap();
        assert_eq!(status, ConfigFileStatus::AlreadyPresent);
        let content = fs::read_to_string(config.env_file_path()).unwrap();
        assert_eq!(content, "SECRET=keep\nOLLAMA_MODEL=mistral\nOLLAMA_HOST=http://localhost:11434\n");
    }

    #[test]
    fn test_materialize_copies_template() {
        let (_dir, config) = project();
        fs::write(config.env_template_path(), "OLLAMA_HOST=http://gpu:11434\nOLLAMA_MODEL=llama2\n").unwrap();
        let (provisioner, sink) = provisioner(MockCommandRunner::new());

        let status = provisioner.materialize_config(&config).unwrap();
        assert_eq!(status, ConfigFileStatus::CreatedFromTemplate);
        let content = fs::read_to_string(config.env_file_path()).unwrap();
        assert!(content.contains("OLLAMA_HOST=http://gpu:11434"));
        assert!(sink.contains("review and update"));
    }

    #[test]
    fn test_missing_template_is_cfg_002_and_defaults_fix_it() {
        let (_dir, config) = project();
        let (provisioner, _) = provisioner(MockCommandRunner::new());
        match provisioner.materialize_config(&config).unwrap_err() {
            StepError::Coded(e) => assert_eq!(e.code(), ErrorCode::Cfg002),
            other => panic!("unexpected error: {other}"),
        }

        provisioner.write_default_config(&config).unwrap();
        assert_eq!(
            provisioner.materialize_config(&config).unwrap(),
            ConfigFileStatus::AlreadyPresent
        );
    }

    #[test]
    fn test_update_external_config_rewrites_keys() {
        let (_dir, config) = project();
        fs::write(config.env_file_path(), "OLLAMA_HOST=http://old:1\nOTHER=x\n").unwrap();
        let (provisioner, _) = provisioner(MockCommandRunner::new());

        provisioner
            .update_external_config(&config, Some("http://new:2"), Some("phi3"))
            .unwrap();
        let content = fs::read_to_string(config.env_file_path()).unwrap();
        assert_eq!(content, "OLLAMA_HOST=http://new:2\nOTHER=x\nOLLAMA_MODEL=phi3\n");
    }
}
