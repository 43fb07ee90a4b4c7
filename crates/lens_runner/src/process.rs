//! Port owner lookup, service process discovery and termination.
//!
//! The platform-specific parts live behind [`ProcessTable`], with one backend
//! for POSIX-like systems (`lsof`, `ps -eo`, signals) and one for Windows
//! (`netstat`, `tasklist`, `taskkill`). [`platform_table`] picks one at
//! startup. Every lookup is best effort: a missing tool or unparsable output
//! yields nothing rather than an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::command::{CommandSpec, SharedRunner};
use crate::error::RunnerResult;
use crate::port::{find_free_port, PortProbe};

/// Programs that can host the service: Python interpreters and the `flask`
/// entry point. Matched as a prefix of the program name.
const SERVICE_LAUNCHERS: &[&str] = &["python", "flask"];

/// A row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Parent pid, when the platform listing reports one.
    pub ppid: Option<u32>,
    /// Command line, or the whole listing row when no command line is available.
    pub command: String,
}

impl ProcessEntry {
    pub fn new(pid: u32, command: impl Into<String>) -> Self {
        Self {
            pid,
            ppid: None,
            command: command.into(),
        }
    }

    pub fn with_parent(mut self, ppid: u32) -> Self {
        self.ppid = Some(ppid);
        self
    }

    /// Lowercased program name without directory or `.exe`.
    pub fn program(&self) -> String {
        let first = self
            .command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_matches('"');
        let name = first.rsplit(&['/', '\\'][..]).next().unwrap_or(first).to_lowercase();
        match name.strip_suffix(".exe") {
            Some(stem) => stem.to_string(),
            None => name,
        }
    }

    /// Whether this process is a service launcher whose command line holds
    /// one of `tokens` as a run of whole words.
    ///
    /// The program is compared by name, so `/srv/venv/bin/flask run` and
    /// `python -m flask run` both match `flask run`, while an editor or
    /// pager with the token in a file name does not.
    pub fn runs_service(&self, tokens: &[Vec<String>]) -> bool {
        let program = self.program();
        if !SERVICE_LAUNCHERS.iter().any(|l| program.starts_with(l)) {
            return false;
        }
        let words: Vec<String> = std::iter::once(program)
            .chain(
                self.command
                    .split_whitespace()
                    .skip(1)
                    .map(|w| w.trim_matches('"').to_lowercase()),
            )
            .collect();
        tokens.iter().any(|token| {
            !token.is_empty() && words.windows(token.len()).any(|w| w == token.as_slice())
        })
    }
}

/// Platform access to the process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Pid of the process listening on `port`.
    async fn port_owner(&self, port: u16) -> Option<u32>;

    /// Running processes.
    async fn processes(&self) -> Vec<ProcessEntry>;

    /// Stop `pid`, gracefully if the platform allows it.
    async fn terminate(&self, pid: u32, grace: Duration) -> RunnerResult<()>;
}

/// Backend for Linux, macOS and other POSIX-like systems.
pub struct PosixProcessTable {
    runner: SharedRunner,
}

impl PosixProcessTable {
    pub fn new(runner: SharedRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ProcessTable for PosixProcessTable {
    fn platform(&self) -> &'static str {
        "posix"
    }

    async fn port_owner(&self, port: u16) -> Option<u32> {
        if self.runner.which("lsof").is_none() {
            debug!("lsof not available, cannot look up owner of port {}", port);
            return None;
        }
        let spec = CommandSpec::new("lsof").args(["-i", &format!(":{}", port), "-t"]);
        match self.runner.run(&spec).await {
            Ok(output) => parse_lsof_pids(&output.stdout).into_iter().next(),
            Err(e) => {
                debug!("lsof failed: {}", e);
                None
            }
        }
    }

    async fn processes(&self) -> Vec<ProcessEntry> {
        let spec = CommandSpec::new("ps").args(["-eo", "pid=,ppid=,args="]);
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => parse_ps_rows(&output.stdout),
            Ok(output) => {
                debug!("ps exited with {:?}", output.code);
                Vec::new()
            }
            Err(e) => {
                debug!("ps failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> RunnerResult<()> {
        signal_terminate(pid, grace).await
    }
}

/// `pid` as a positive `pid_t`. Zero and values past `pid_t::MAX` would
/// address a process group, so they name no process here.
#[cfg(unix)]
pub(crate) fn posix_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Returns `false` when there is no such process.
#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<bool> {
    let Some(pid) = posix_pid(pid) else {
        return Ok(false);
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// SIGTERM, wait `grace`, then SIGKILL if the process is still alive.
#[cfg(unix)]
async fn signal_terminate(pid: u32, grace: Duration) -> RunnerResult<()> {
    if !send_signal(pid, libc::SIGTERM)? {
        return Ok(());
    }
    tokio::time::sleep(grace).await;
    if send_signal(pid, 0)? {
        debug!("Process {} still alive after SIGTERM, sending SIGKILL", pid);
        send_signal(pid, libc::SIGKILL)?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn signal_terminate(_pid: u32, _grace: Duration) -> RunnerResult<()> {
    Err(crate::error::RunnerError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are only available on POSIX-like systems",
    )))
}

/// Backend for Windows.
pub struct WindowsProcessTable {
    runner: SharedRunner,
}

impl WindowsProcessTable {
    pub fn new(runner: SharedRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ProcessTable for WindowsProcessTable {
    fn platform(&self) -> &'static str {
        "windows"
    }

    async fn port_owner(&self, port: u16) -> Option<u32> {
        match self.runner.run(&CommandSpec::new("netstat").arg("-ano")).await {
            Ok(output) => parse_netstat_listener(&output.stdout, port),
            Err(e) => {
                debug!("netstat failed: {}", e);
                None
            }
        }
    }

    async fn processes(&self) -> Vec<ProcessEntry> {
        let spec = CommandSpec::new("tasklist").args([
            "/v",
            "/fi",
            "imagename eq python.exe",
            "/fo",
            "csv",
            "/nh",
        ]);
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => parse_tasklist_csv(&output.stdout),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("tasklist failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn terminate(&self, pid: u32, _grace: Duration) -> RunnerResult<()> {
        let spec = CommandSpec::new("taskkill").args(["/PID", &pid.to_string(), "/F"]);
        self.runner.run(&spec).await?.check("taskkill")?;
        Ok(())
    }
}

/// The backend for the platform this binary was built for.
pub fn platform_table(runner: SharedRunner) -> Arc<dyn ProcessTable> {
    if cfg!(windows) {
        Arc::new(WindowsProcessTable::new(runner))
    } else {
        Arc::new(PosixProcessTable::new(runner))
    }
}

/// Pids printed one per line by `lsof -t`.
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Pid of the `LISTENING` row bound to `port` in `netstat -ano` output.
pub fn parse_netstat_listener(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{}", port);
    output
        .lines()
        .filter(|line| line.contains("LISTENING"))
        .find_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let local = columns.get(1)?;
            if !local.ends_with(&suffix) {
                return None;
            }
            columns.last()?.parse().ok()
        })
}

/// Rows of `ps -eo pid=,ppid=,args=`.
pub fn parse_ps_rows(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let pid = columns.next()?.parse().ok()?;
            let ppid = columns.next()?.parse().ok()?;
            let command = columns.collect::<Vec<_>>().join(" ");
            Some(ProcessEntry::new(pid, command).with_parent(ppid))
        })
        .collect()
}

/// Rows of `tasklist /fo csv /nh`: pid in the second field.
pub fn parse_tasklist_csv(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_csv_line(line);
            let pid = fields.get(1)?.trim().parse().ok()?;
            Some(ProcessEntry::new(pid, fields.join(" ")))
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.trim().chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Port and process operations for the supervised service.
#[derive(Clone)]
pub struct ProcessResolver {
    table: Arc<dyn ProcessTable>,
    probe: Arc<dyn PortProbe>,
    own_pid: u32,
    grace: Duration,
}

impl ProcessResolver {
    pub fn new(table: Arc<dyn ProcessTable>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            table,
            probe,
            own_pid: std::process::id(),
            grace: Duration::from_secs(2),
        }
    }

    /// Wait between SIGTERM and SIGKILL.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Pid treated as the supervisor itself.
    pub fn own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    pub fn platform(&self) -> &'static str {
        self.table.platform()
    }

    pub async fn is_port_in_use(&self, port: u16) -> bool {
        self.probe.is_in_use(port).await
    }

    pub async fn find_owner_pid(&self, port: u16) -> Option<u32> {
        self.table
            .port_owner(port)
            .await
            .filter(|pid| *pid != self.own_pid)
    }

    /// Pids of service launchers matching one of `signature`,
    /// case-insensitively. The supervisor and its ancestors are never listed.
    pub async fn find_service_processes(&self, signature: &[String]) -> Vec<u32> {
        let tokens: Vec<Vec<String>> = signature
            .iter()
            .map(|s| s.split_whitespace().map(str::to_lowercase).collect())
            .collect();
        let entries = self.table.processes().await;
        let excluded = self.lineage(&entries);
        let mut pids: Vec<u32> = entries
            .iter()
            .filter(|entry| !excluded.contains(&entry.pid) && entry.runs_service(&tokens))
            .map(|entry| entry.pid)
            .collect();
        pids.dedup();
        pids
    }

    /// The supervisor's pid followed up through its parents.
    fn lineage(&self, entries: &[ProcessEntry]) -> HashSet<u32> {
        let parents: HashMap<u32, u32> = entries
            .iter()
            .filter_map(|e| Some((e.pid, e.ppid?)))
            .collect();
        let mut lineage = HashSet::from([self.own_pid]);
        let mut current = self.own_pid;
        while let Some(&parent) = parents.get(&current) {
            if parent == 0 || !lineage.insert(parent) {
                break;
            }
            current = parent;
        }
        lineage
    }

    /// Stop `pid`. Returns whether the termination went through.
    pub async fn terminate(&self, pid: u32) -> bool {
        if pid == self.own_pid {
            warn!("Refusing to terminate the supervisor itself (PID {})", pid);
            return false;
        }
        match self.table.terminate(pid, self.grace).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to terminate process {}: {}", pid, e);
                false
            }
        }
    }

    pub async fn find_free_port(&self, start: u16, max_attempts: u16) -> Option<u16> {
        find_free_port(self.probe.as_ref(), start, max_attempts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommandRunner, MockResponse};

    const PS_ROWS: &str = "\
    1     0 /sbin/init
 4200     1 -bash
 4242  4200 /srv/backend/venv/bin/python -m flask run --host 0.0.0.0 --port 5050
 4250  4200 /srv/backend/venv/bin/flask run --port 6000
 4300  4200 grep flask run
 4310  4200 vim logiclens.toml
 4311  4200 tail -f /var/log/logiclens/app.log
 4312  4200 python3 scripts/dev.py flask run
 4313  4312 target/debug/logiclens stop
 4320  4200 python3 -m http.server 8000
";

    const NETSTAT: &str = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:50501          0.0.0.0:0              LISTENING       111
  TCP    0.0.0.0:5050           0.0.0.0:0              LISTENING       7788
  TCP    127.0.0.1:5050         127.0.0.1:61000        ESTABLISHED     9999
";

    const TASKLIST: &str = "\
\"python.exe\",\"6120\",\"Console\",\"1\",\"45,120 K\",\"Running\",\"DEV\\dev\",\"0:00:03\",\"flask run\"
\"python.exe\",\"6200\",\"Console\",\"1\",\"12,000 K\",\"Running\",\"DEV\\dev\",\"0:00:01\",\"N/A\"
";

    #[test]
    fn test_parse_ps_rows() {
        let entries = parse_ps_rows(PS_ROWS);
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[2].pid, 4242);
        assert_eq!(entries[2].ppid, Some(4200));
        assert!(entries[2].command.starts_with("/srv/backend/venv/bin/python -m flask run"));
        assert_eq!(entries[2].program(), "python");
        assert_eq!(entries[3].program(), "flask");
    }

    #[test]
    fn test_runs_service_needs_launcher_and_whole_words() {
        let tokens = vec![vec!["flask".to_string(), "run".to_string()]];
        assert!(ProcessEntry::new(1, "python3.11 -m flask run").runs_service(&tokens));
        assert!(ProcessEntry::new(1, r#""C:\Python\python.exe" -m flask run"#).runs_service(&tokens));
        assert!(!ProcessEntry::new(1, "grep flask run").runs_service(&tokens));
        assert!(!ProcessEntry::new(1, "python -m flask runserver").runs_service(&tokens));
        assert!(!ProcessEntry::new(1, "python -m flask").runs_service(&tokens));
    }

    #[test]
    fn test_parse_netstat_matches_exact_port() {
        assert_eq!(parse_netstat_listener(NETSTAT, 5050), Some(7788));
        assert_eq!(parse_netstat_listener(NETSTAT, 50501), Some(111));
        assert_eq!(parse_netstat_listener(NETSTAT, 8080), None);
    }

    #[test]
    fn test_parse_tasklist_csv_handles_quoted_commas() {
        let entries = parse_tasklist_csv(TASKLIST);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pid, 6120);
        assert!(entries[0].command.contains("45,120 K"));
        assert!(entries[0].command.contains("flask run"));
    }

    #[test]
    fn test_parse_lsof_ignores_noise() {
        assert_eq!(parse_lsof_pids("1234\n5678\n\n"), vec![1234, 5678]);
        assert!(parse_lsof_pids("lsof: WARNING").is_empty());
    }

    struct NoPorts;

    #[async_trait]
    impl PortProbe for NoPorts {
        async fn is_in_use(&self, _port: u16) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_service_processes_skip_unrelated_and_ancestors() {
        let runner = MockCommandRunner::new().on("ps -eo", MockResponse::success(PS_ROWS));
        let table = Arc::new(PosixProcessTable::new(Arc::new(runner)));
        let resolver = ProcessResolver::new(table, Arc::new(NoPorts)).own_pid(4313);

        let signature = vec!["flask run".to_string()];
        assert_eq!(resolver.find_service_processes(&signature).await, vec![4242, 4250]);
    }

    #[tokio::test]
    async fn test_posix_owner_requires_lsof() {
        let runner = MockCommandRunner::new().on("lsof -i :5050 -t", MockResponse::success("4242\n"));
        let table = PosixProcessTable::new(Arc::new(runner.clone()));
        assert_eq!(table.port_owner(5050).await, None);
        assert!(!runner.was_called("lsof"));

        let runner = runner.with_program("lsof");
        let table = PosixProcessTable::new(Arc::new(runner));
        assert_eq!(table.port_owner(5050).await, Some(4242));
    }

    #[tokio::test]
    async fn test_windows_backend_uses_taskkill() {
        let runner = MockCommandRunner::new()
            .on("netstat -ano", MockResponse::success(NETSTAT))
            .on("taskkill /PID 7788 /F", MockResponse::success("SUCCESS"))
            .on("taskkill", MockResponse::failure(128, "not found"));
        let table = Arc::new(WindowsProcessTable::new(Arc::new(runner.clone())));
        let resolver = ProcessResolver::new(table, Arc::new(NoPorts));

        assert_eq!(resolver.find_owner_pid(5050).await, Some(7788));
        assert!(resolver.terminate(7788).await);
        assert!(!resolver.terminate(1).await);
        assert_eq!(resolver.platform(), "windows");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_out_of_range_pids_are_never_signalled() {
        assert_eq!(posix_pid(4242), Some(4242));
        assert_eq!(posix_pid(0), None);
        assert_eq!(posix_pid(u32::MAX), None);
        assert_eq!(posix_pid(1 << 31), None);

        signal_terminate(u32::MAX, Duration::ZERO).await.unwrap();
        assert!(!send_signal(0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_refuses_to_terminate_itself() {
        let table = Arc::new(PosixProcessTable::new(Arc::new(MockCommandRunner::new())));
        let resolver = ProcessResolver::new(table, Arc::new(NoPorts));
        assert!(!resolver.terminate(std::process::id()).await);
    }
}
