//! Environment diagnostics collector.

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lens_core::{DiagnosticsReport, EnvironmentProbe, RuntimeConfig};

use crate::command::{CommandSpec, SharedRunner};
use crate::port::PortProbe;
use crate::provision::PythonVersion;

/// Gathers the facts logged alongside environment and system errors.
pub struct DiagnosticsCollector {
    runner: SharedRunner,
    probe: Arc<dyn PortProbe>,
}

impl DiagnosticsCollector {
    pub fn new(runner: SharedRunner, probe: Arc<dyn PortProbe>) -> Self {
        Self { runner, probe }
    }

    async fn python_version(&self) -> Option<PythonVersion> {
        for program in ["python3", "python"] {
            let spec = CommandSpec::new(program)
                .arg("--version")
                .timeout(Duration::from_secs(5));
            if let Ok(output) = self.runner.run(&spec).await {
                if let Some(version) = PythonVersion::parse(&output.combined_output()) {
                    return Some(version);
                }
            }
        }
        None
    }
}

#[async_trait]
impl EnvironmentProbe for DiagnosticsCollector {
    async fn collect(&self, config: &RuntimeConfig) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::new();

        let os = match os_release() {
            Some(release) => format!("{} {}", env::consts::OS, release),
            None => env::consts::OS.to_string(),
        };
        report.push("OS", os);
        report.push("Supervisor", env!("CARGO_PKG_VERSION"));
        report.push_opt("Python", self.python_version().await);

        let cwd = env::current_dir().ok();
        report.push_opt("Current directory", cwd.as_ref().map(|p| p.display()));
        report.push_opt(
            "Executable",
            env::current_exe().ok().as_ref().map(|p| p.display()),
        );
        report.push(
            "In virtual environment",
            env::var_os("VIRTUAL_ENV").is_some(),
        );
        report.push("Backend directory exists", config.backend_path().exists());
        report.push("Virtual environment exists", config.venv_path().exists());
        report.push_opt(
            "Disk space",
            cwd.as_deref()
                .and_then(free_disk_bytes)
                .map(|bytes| format!("{:.2} GB free", bytes as f64 / 1024f64.powi(3))),
        );
        report.push(
            format!("Port {} in use", config.port),
            self.probe.is_in_use(config.port).await,
        );

        report
    }
}

#[cfg(unix)]
fn os_release() -> Option<String> {
    use std::ffi::CStr;

    // SAFETY: utsname is plain old data and uname fills it on success.
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
    release.to_str().ok().map(str::to_string)
}

#[cfg(not(unix))]
fn os_release() -> Option<String> {
    None
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn free_disk_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs is plain old data and is only read after success.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_disk_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommandRunner, MockResponse};
    use tempfile::TempDir;

    struct BusyProbe;

    #[async_trait]
    impl PortProbe for BusyProbe {
        async fn is_in_use(&self, _port: u16) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_collect_reports_configured_paths_and_port() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("backend")).unwrap();
        let config = RuntimeConfig::default()
            .project_dir(temp_dir.path())
            .port(6060);

        let runner = MockCommandRunner::new().on("python3 --version", MockResponse::success("Python 3.11.4\n"));
        let collector = DiagnosticsCollector::new(Arc::new(runner), Arc::new(BusyProbe));
        let report = collector.collect(&config).await;

        assert_eq!(report.get("Backend directory exists"), Some("true"));
        assert_eq!(report.get("Virtual environment exists"), Some("false"));
        assert_eq!(report.get("Port 6060 in use"), Some("true"));
        assert_eq!(report.get("Python"), Some("3.11.4"));
        assert!(report.get("OS").is_some());
    }

    #[tokio::test]
    async fn test_collect_survives_failing_probes() {
        let runner = MockCommandRunner::new().on("--version", MockResponse::not_found());
        let collector = DiagnosticsCollector::new(Arc::new(runner), Arc::new(BusyProbe));
        let report = collector.collect(&RuntimeConfig::default()).await;

        assert_eq!(report.get("Python"), None);
        assert!(report.get("Current directory").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_free_disk_bytes() {
        let temp_dir = TempDir::new().unwrap();
        assert!(free_disk_bytes(temp_dir.path()).is_some());
        assert!(free_disk_bytes(Path::new("/definitely/not/here")).is_none());
    }
}
