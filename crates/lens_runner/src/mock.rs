//! Mocks for testing.
//!
//! Provides a configurable implementation of [`CommandRunner`] that matches
//! command lines against registered patterns, records every call, and never
//! starts a real process. In-memory port, process table and inference
//! backend fakes live here too so that the supervisor crate can share them.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::command::{ChildHandle, CommandOutput, CommandRunner, CommandSpec, ExitInfo};
use crate::error::{RunnerError, RunnerResult};
use crate::ollama::OllamaApi;
use crate::port::PortProbe;
use crate::process::{ProcessEntry, ProcessTable};

/// Predefined response for a matching command.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// The command ran and produced this output.
    Output(CommandOutput),
    /// The command could not be started.
    SpawnError(io::ErrorKind),
    /// The command exceeded its timeout.
    Timeout,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self::Output(CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self::Output(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        })
    }

    pub fn not_found() -> Self {
        Self::SpawnError(io::ErrorKind::NotFound)
    }

    fn resolve(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput> {
        match self {
            Self::Output(output) => Ok(output.clone()),
            Self::SpawnError(kind) => Err(RunnerError::Spawn {
                program: spec.program.clone(),
                source: io::Error::new(*kind, "mock spawn failure"),
            }),
            Self::Timeout => Err(RunnerError::Timeout {
                program: spec.program_name().to_string(),
                secs: spec.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
        }
    }
}

/// How a spawned mock child behaves.
#[derive(Debug, Clone, Copy)]
pub struct ChildScript {
    /// Exit on its own after this long; `None` runs until terminated.
    pub exit_after: Option<Duration>,
    pub exit: ExitInfo,
}

impl ChildScript {
    /// A child that keeps running until terminated.
    pub fn long_running() -> Self {
        Self {
            exit_after: None,
            exit: ExitInfo::code(0),
        }
    }

    /// A child that exits with `code` after `delay`.
    pub fn exits_after(delay: Duration, code: i32) -> Self {
        Self {
            exit_after: Some(delay),
            exit: ExitInfo::code(code),
        }
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCommand {
    pub method: String,
    pub spec: CommandSpec,
}

impl CapturedCommand {
    pub fn command_line(&self) -> String {
        self.spec.to_string()
    }
}

/// Side effect run when a matching command is executed.
pub type MockHook = Arc<dyn Fn(&CommandSpec) + Send + Sync>;

#[derive(Default)]
struct Rule {
    responses: Vec<MockResponse>,
    next: usize,
}

/// Mock command runner for testing.
///
/// Patterns are plain substrings of the rendered command line. When several
/// patterns match, the one registered first wins. Each pattern plays its
/// responses in order and repeats the last one once exhausted.
#[derive(Clone, Default)]
pub struct MockCommandRunner {
    rules: Arc<RwLock<Vec<(String, Rule)>>>,
    hooks: Arc<RwLock<Vec<(String, MockHook)>>>,
    programs: Arc<RwLock<HashMap<String, PathBuf>>>,
    child_script: Arc<RwLock<Vec<ChildScript>>>,
    terminated: Arc<RwLock<Vec<Option<u32>>>>,
    captured_calls: Arc<RwLock<Vec<CapturedCommand>>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to commands containing `pattern`.
    pub fn on(self, pattern: impl Into<String>, response: MockResponse) -> Self {
        let pattern = pattern.into();
        {
            let mut rules = self.rules.write();
            match rules.iter_mut().find(|(p, _)| *p == pattern) {
                Some((_, rule)) => rule.responses.push(response),
                None => rules.push((
                    pattern,
                    Rule {
                        responses: vec![response],
                        next: 0,
                    },
                )),
            }
        }
        self
    }

    /// Run `hook` whenever a command containing `pattern` is executed.
    pub fn with_hook(
        self,
        pattern: impl Into<String>,
        hook: impl Fn(&CommandSpec) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.write().push((pattern.into(), Arc::new(hook)));
        self
    }

    /// Make `which(name)` succeed.
    pub fn with_program(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.programs
            .write()
            .insert(name.clone(), PathBuf::from("/usr/bin").join(name));
        self
    }

    /// Queue the behavior of the next spawned child. The last one repeats.
    pub fn with_child(self, script: ChildScript) -> Self {
        self.child_script.write().push(script);
        self
    }

    pub fn get_calls(&self) -> Vec<CapturedCommand> {
        self.captured_calls.read().clone()
    }

    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCommand> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Whether any call's command line contains `needle`.
    pub fn was_called(&self, needle: &str) -> bool {
        self.captured_calls
            .read()
            .iter()
            .any(|c| c.command_line().contains(needle))
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// Pids of spawned children that were terminated.
    pub fn terminated(&self) -> Vec<Option<u32>> {
        self.terminated.read().clone()
    }

    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    fn record_call(&self, method: &str, spec: &CommandSpec) {
        self.captured_calls.write().push(CapturedCommand {
            method: method.to_string(),
            spec: spec.clone(),
        });
    }

    fn run_hooks(&self, spec: &CommandSpec) {
        let line = spec.to_string();
        let hooks: Vec<MockHook> = self
            .hooks
            .read()
            .iter()
            .filter(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(spec);
        }
    }

    fn next_response(&self, spec: &CommandSpec) -> MockResponse {
        let line = spec.to_string();
        let mut rules = self.rules.write();
        for (pattern, rule) in rules.iter_mut() {
            if line.contains(pattern.as_str()) && !rule.responses.is_empty() {
                let index = rule.next.min(rule.responses.len() - 1);
                rule.next += 1;
                return rule.responses[index].clone();
            }
        }
        MockResponse::success("")
    }

    fn next_child(&self) -> ChildScript {
        let mut scripts = self.child_script.write();
        if scripts.len() > 1 {
            scripts.remove(0)
        } else {
            scripts.first().copied().unwrap_or_else(ChildScript::long_running)
        }
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput> {
        self.record_call("run", spec);
        let response = self.next_response(spec);
        if matches!(response, MockResponse::Output(_)) {
            self.run_hooks(spec);
        }
        response.resolve(spec)
    }

    async fn spawn(&self, spec: &CommandSpec) -> RunnerResult<Box<dyn ChildHandle>> {
        self.record_call("spawn", spec);
        if let MockResponse::SpawnError(kind) = self.next_response(spec) {
            return Err(RunnerError::Spawn {
                program: spec.program.clone(),
                source: io::Error::new(kind, "mock spawn failure"),
            });
        }
        self.run_hooks(spec);
        let pid = 40_000 + self.call_count() as u32;
        Ok(Box::new(MockChild {
            pid,
            script: self.next_child(),
            started: Instant::now(),
            killed: false,
            terminated: self.terminated.clone(),
        }))
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> RunnerResult<Option<u32>> {
        self.record_call("spawn_detached", spec);
        self.next_response(spec).resolve(spec)?;
        self.run_hooks(spec);
        Ok(Some(50_000 + self.call_count() as u32))
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        self.programs.read().get(program).cloned()
    }
}

/// Child process produced by [`MockCommandRunner::spawn`].
pub struct MockChild {
    pid: u32,
    script: ChildScript,
    started: Instant,
    killed: bool,
    terminated: Arc<RwLock<Vec<Option<u32>>>>,
}

#[async_trait]
impl ChildHandle for MockChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> RunnerResult<Option<ExitInfo>> {
        if self.killed {
            return Ok(Some(ExitInfo::signaled()));
        }
        Ok(match self.script.exit_after {
            Some(delay) if self.started.elapsed() >= delay => Some(self.script.exit),
            _ => None,
        })
    }

    async fn wait(&mut self) -> RunnerResult<ExitInfo> {
        if self.killed {
            return Ok(ExitInfo::signaled());
        }
        match self.script.exit_after {
            Some(delay) => {
                tokio::time::sleep_until(self.started + delay).await;
                Ok(self.script.exit)
            }
            None => std::future::pending().await,
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> RunnerResult<ExitInfo> {
        if let Some(exit) = self.try_wait()? {
            return Ok(exit);
        }
        self.killed = true;
        self.terminated.write().push(Some(self.pid));
        Ok(ExitInfo::signaled())
    }
}

#[derive(Debug, Default)]
struct OllamaState {
    unreachable: bool,
    models: Vec<String>,
    pull_fails: bool,
    pulls: Vec<String>,
}

/// In-memory stand-in for an Ollama server.
///
/// Pulling a model adds it to the model list unless pulls are set to fail.
#[derive(Debug, Clone, Default)]
pub struct MockOllamaApi {
    state: Arc<RwLock<OllamaState>>,
}

impl MockOllamaApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that refuses connections.
    pub fn unreachable() -> Self {
        let api = Self::new();
        api.set_reachable(false);
        api
    }

    pub fn with_models<I, S>(self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .write()
            .models
            .extend(models.into_iter().map(Into::into));
        self
    }

    pub fn failing_pulls(self) -> Self {
        self.state.write().pull_fails = true;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.write().unreachable = !reachable;
    }

    /// Models requested through `pull_model`.
    pub fn pulled(&self) -> Vec<String> {
        self.state.read().pulls.clone()
    }

    fn refused() -> RunnerError {
        RunnerError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }
}

#[async_trait]
impl OllamaApi for MockOllamaApi {
    async fn list_models(&self) -> RunnerResult<Vec<String>> {
        let state = self.state.read();
        if state.unreachable {
            return Err(Self::refused());
        }
        Ok(state.models.clone())
    }

    async fn pull_model(&self, model: &str) -> RunnerResult<()> {
        let mut state = self.state.write();
        if state.unreachable {
            return Err(Self::refused());
        }
        state.pulls.push(model.to_string());
        if state.pull_fails {
            return Err(RunnerError::Api {
                status: 404,
                body: format!("pull model manifest: file does not exist: {}", model),
            });
        }
        state.models.push(format!("{}:latest", model));
        Ok(())
    }
}

/// Port probe backed by a set of busy ports.
#[derive(Debug, Clone, Default)]
pub struct MockPortProbe {
    busy: Arc<RwLock<HashSet<u16>>>,
}

impl MockPortProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_busy(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.busy.write().extend(ports);
        self
    }

    pub fn occupy(&self, port: u16) {
        self.busy.write().insert(port);
    }

    pub fn release(&self, port: u16) {
        self.busy.write().remove(&port);
    }
}

#[async_trait]
impl PortProbe for MockPortProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        self.busy.read().contains(&port)
    }
}

#[derive(Debug, Default)]
struct TableState {
    owners: HashMap<u16, u32>,
    processes: Vec<ProcessEntry>,
    stubborn: HashSet<u32>,
    terminated: Vec<u32>,
}

/// In-memory process table.
///
/// Terminating a pid removes it from the table and, when a probe is linked,
/// releases the ports it owned. Stubborn pids refuse to die.
#[derive(Debug, Clone, Default)]
pub struct MockProcessTable {
    state: Arc<RwLock<TableState>>,
    probe: Option<MockPortProbe>,
}

impl MockProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release owned ports on this probe when their owner is terminated.
    pub fn linked_to(mut self, probe: &MockPortProbe) -> Self {
        self.probe = Some(probe.clone());
        self
    }

    pub fn with_owner(self, port: u16, pid: u32) -> Self {
        self.state.write().owners.insert(port, pid);
        if let Some(probe) = &self.probe {
            probe.occupy(port);
        }
        self
    }

    pub fn with_process(self, pid: u32, command: impl Into<String>) -> Self {
        self.state
            .write()
            .processes
            .push(ProcessEntry::new(pid, command));
        self
    }

    /// Add a process started by `ppid`.
    pub fn with_process_under(self, pid: u32, ppid: u32, command: impl Into<String>) -> Self {
        self.state
            .write()
            .processes
            .push(ProcessEntry::new(pid, command).with_parent(ppid));
        self
    }

    pub fn stubborn(self, pid: u32) -> Self {
        self.state.write().stubborn.insert(pid);
        self
    }

    /// Pids that were asked to terminate, in order.
    pub fn terminated(&self) -> Vec<u32> {
        self.state.read().terminated.clone()
    }
}

#[async_trait]
impl ProcessTable for MockProcessTable {
    fn platform(&self) -> &'static str {
        "mock"
    }

    async fn port_owner(&self, port: u16) -> Option<u32> {
        self.state.read().owners.get(&port).copied()
    }

    async fn processes(&self) -> Vec<ProcessEntry> {
        self.state.read().processes.clone()
    }

    async fn terminate(&self, pid: u32, _grace: Duration) -> RunnerResult<()> {
        let released: Vec<u16> = {
            let mut state = self.state.write();
            state.terminated.push(pid);
            if state.stubborn.contains(&pid) {
                return Err(RunnerError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "Operation not permitted",
                )));
            }
            state.processes.retain(|p| p.pid != pid);
            let ports: Vec<u16> = state
                .owners
                .iter()
                .filter(|(_, owner)| **owner == pid)
                .map(|(port, _)| *port)
                .collect();
            for port in &ports {
                state.owners.remove(port);
            }
            ports
        };
        if let Some(probe) = &self.probe {
            for port in released {
                probe.release(port);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_patterns_play_in_order_then_repeat() {
        let runner = MockCommandRunner::new()
            .on("lsof", MockResponse::success("4242\n"))
            .on("lsof", MockResponse::success(""));

        let spec = CommandSpec::new("lsof").args(["-i", ":5050", "-t"]);
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "4242\n");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "");
        assert_eq!(runner.get_method_calls("run").len(), 3);
    }

    #[tokio::test]
    async fn test_unmatched_commands_succeed() {
        let runner = MockCommandRunner::new();
        let output = runner.run(&CommandSpec::new("true")).await.unwrap();
        assert!(output.success());
        assert!(runner.was_called("true"));
    }

    #[tokio::test]
    async fn test_spawn_error_and_hooks() {
        let hits = Arc::new(AtomicBool::new(false));
        let seen = hits.clone();
        let runner = MockCommandRunner::new()
            .on("python3.8", MockResponse::not_found())
            .with_hook("-m venv", move |_| seen.store(true, Ordering::SeqCst));

        let err = runner
            .run(&CommandSpec::new("python3.8").arg("--version"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));

        runner
            .run(&CommandSpec::new("python3").args(["-m", "venv", "venv"]))
            .await
            .unwrap();
        assert!(hits.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_scripts() {
        let runner = MockCommandRunner::new()
            .with_child(ChildScript::exits_after(Duration::from_secs(1), 1))
            .with_child(ChildScript::long_running());

        let mut crashing = runner.spawn(&CommandSpec::new("flask")).await.unwrap();
        assert!(crashing.try_wait().unwrap().is_none());
        assert_eq!(crashing.wait().await.unwrap(), ExitInfo::code(1));

        let mut server = runner.spawn(&CommandSpec::new("flask")).await.unwrap();
        let exit = server.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, ExitInfo::signaled());
        assert_eq!(runner.terminated(), vec![server.id()]);
    }

    #[tokio::test]
    async fn test_mock_ollama_pull_adds_model() {
        let api = MockOllamaApi::new();
        assert!(api.list_models().await.unwrap().is_empty());
        api.pull_model("llama2").await.unwrap();
        assert_eq!(api.list_models().await.unwrap(), vec!["llama2:latest"]);
        assert_eq!(api.pulled(), vec!["llama2"]);

        api.set_reachable(false);
        assert!(!api.is_healthy().await);
    }

    #[tokio::test]
    async fn test_mock_process_table_releases_ports() {
        let probe = MockPortProbe::new();
        let table = MockProcessTable::new()
            .linked_to(&probe)
            .with_owner(5050, 4242)
            .with_process(4242, "python -m flask run");

        assert!(probe.is_in_use(5050).await);
        table.terminate(4242, Duration::ZERO).await.unwrap();
        assert!(!probe.is_in_use(5050).await);
        assert!(table.processes().await.is_empty());
        assert_eq!(table.terminated(), vec![4242]);
    }
}
