//! Subprocess execution.
//!
//! Everything the supervisor runs goes through a [`CommandRunner`], so that
//! provisioning, process lookup and recovery can be exercised against a
//! [`crate::MockCommandRunner`] in tests.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lens_core::executable_name;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};

/// A command line plus its execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Upper bound for `run`; ignored by `spawn`.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        Self {
            program: program.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// File name of the program, without directories.
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('=') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout and stderr joined, whichever are non-empty.
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Turn a non-zero exit into [`RunnerError::CommandFailed`].
    pub fn check(self, program: &str) -> RunnerResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RunnerError::CommandFailed {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// How a spawned process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signaled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A long-running child process owned by the supervisor.
#[async_trait]
pub trait ChildHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> RunnerResult<Option<ExitInfo>>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> RunnerResult<ExitInfo>;

    /// Ask the process to stop, waiting up to `grace` before killing it.
    async fn terminate(&mut self, grace: Duration) -> RunnerResult<ExitInfo>;
}

/// Subprocess execution interface.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is not an error.
    async fn run(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput>;

    /// Start a child with inherited stdio that the caller supervises. The
    /// child is killed if its handle is dropped.
    async fn spawn(&self, spec: &CommandSpec) -> RunnerResult<Box<dyn ChildHandle>>;

    /// Start a background process that outlives the caller. Output is discarded.
    async fn spawn_detached(&self, spec: &CommandSpec) -> RunnerResult<Option<u32>>;

    /// Locate an executable on `PATH`.
    fn which(&self, program: &str) -> Option<PathBuf>;
}

/// Shared handle to a runner.
pub type SharedRunner = Arc<dyn CommandRunner>;

/// Runner backed by real operating-system processes.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn_error(spec: &CommandSpec, source: std::io::Error) -> RunnerError {
        RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput> {
        debug!("Executing: {}", spec);
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| RunnerError::Timeout {
                    program: spec.program_name().to_string(),
                    secs: limit.as_secs(),
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| Self::spawn_error(spec, e))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, spec: &CommandSpec) -> RunnerResult<Box<dyn ChildHandle>> {
        debug!("Spawning: {}", spec);
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| Self::spawn_error(spec, e))?;
        Ok(Box::new(SystemChild {
            program: spec.program_name().to_string(),
            child,
        }))
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> RunnerResult<Option<u32>> {
        debug!("Spawning detached: {}", spec);
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd.spawn().map_err(|e| Self::spawn_error(spec, e))?;
        Ok(child.id())
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        find_in_path(program, env::var_os("PATH"))
    }
}

/// Search `path_var` for `program`, honouring the platform executable suffix.
pub fn find_in_path(program: &str, path_var: Option<std::ffi::OsString>) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let name = if program.ends_with(".exe") {
        program.to_string()
    } else {
        executable_name(program)
    };
    env::split_paths(&path_var?)
        .map(|dir| dir.join(&name))
        .find(|path| path.is_file())
}

struct SystemChild {
    program: String,
    child: Child,
}

#[async_trait]
impl ChildHandle for SystemChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> RunnerResult<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    async fn wait(&mut self) -> RunnerResult<ExitInfo> {
        Ok(self.child.wait().await?.into())
    }

    async fn terminate(&mut self, grace: Duration) -> RunnerResult<ExitInfo> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id().and_then(crate::process::posix_pid) {
                // SAFETY: plain signal delivery to our own child.
                if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
                    if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                        return Ok(status?.into());
                    }
                    warn!(
                        "{} did not exit within {}s, killing it",
                        self.program,
                        grace.as_secs()
                    );
                }
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.child.kill().await?;
        Ok(self.child.wait().await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_display_quotes_args_with_spaces() {
        let spec = CommandSpec::new("pip")
            .args(["install", "-r", "my requirements.txt"])
            .env("FLASK_APP", "app");
        assert_eq!(spec.to_string(), "pip install -r 'my requirements.txt'");
    }

    #[test]
    fn test_program_name_strips_directories() {
        let spec = CommandSpec::new(Path::new("backend").join("venv").join("pip"));
        assert_eq!(spec.program_name(), "pip");
    }

    #[test]
    fn test_check_reports_stderr() {
        let output = CommandOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };
        let err = output.check("lsof").unwrap_err();
        assert_eq!(err.to_string(), "lsof exited with status 2: boom");
    }

    #[test]
    fn test_find_in_path() {
        let temp_dir = TempDir::new().unwrap();
        let tool = temp_dir.path().join(executable_name("fake-tool"));
        std::fs::write(&tool, "").unwrap();

        let path_var = env::join_paths([temp_dir.path()]).ok();
        assert_eq!(find_in_path("fake-tool", path_var.clone()), Some(tool));
        assert_eq!(find_in_path("missing-tool", path_var), None);
        assert_eq!(find_in_path("anything", None), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-program-4242"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), lens_core::FailureKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_child() {
        let runner = SystemCommandRunner::new();
        let mut child = runner
            .spawn(&CommandSpec::new("sleep").arg("30"))
            .await
            .unwrap();
        assert!(child.try_wait().unwrap().is_none());
        let exit = child.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!exit.success());
    }
}
