//! # lens_runner
//!
//! Operating-system plumbing for the LogicLens supervisor.
//!
//! Everything that touches processes, ports, the filesystem layout of the
//! backend, or the inference backend lives here, behind traits that the
//! supervisor can swap for in-memory mocks.
//!
//! # Features
//!
//! - **Command Runner**: run, spawn and detach subprocesses via tokio
//! - **Port & Process Resolver**: port checks, owner lookup, signature search and termination
//!   with POSIX (`lsof`/`ps`/signals) and Windows (`netstat`/`tasklist`/`taskkill`) backends
//! - **Diagnostics Collector**: environment report for environment and system errors
//! - **Environment Provisioner**: virtual environment, dependencies and `.env` handling
//! - **Ollama Verifier**: reachability, model availability, install, start and pull
//! - **Mocks**: scripted command runner, port probe, process table and Ollama API
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lens_core::{RuntimeConfig, TracingSink};
//! use lens_runner::{EnvironmentProvisioner, SystemCommandRunner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::default();
//!     let provisioner = EnvironmentProvisioner::new(
//!         Arc::new(SystemCommandRunner::new()),
//!         Arc::new(TracingSink),
//!     );
//!
//!     provisioner.ensure_environment(&config).await?;
//!     provisioner.install_dependencies(&config).await?;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod diagnostics;
pub mod error;
pub mod mock;
pub mod ollama;
pub mod port;
pub mod process;
pub mod provision;

pub use command::{
    find_in_path, ChildHandle, CommandOutput, CommandRunner, CommandSpec, ExitInfo, SharedRunner,
    SystemCommandRunner,
};
pub use diagnostics::{free_disk_bytes, DiagnosticsCollector};
pub use error::{RunnerError, RunnerResult};
pub use mock::{
    CapturedCommand, ChildScript, MockCommandRunner, MockOllamaApi, MockPortProbe,
    MockProcessTable, MockResponse,
};
pub use ollama::{
    installable, model_available, parse_model_list, ExternalServiceVerifier, OllamaApi,
    OllamaClient,
};
pub use port::{find_free_port, PortProbe, TcpPortProbe};
pub use process::{
    platform_table, PosixProcessTable, ProcessEntry, ProcessResolver, ProcessTable,
    WindowsProcessTable,
};
pub use provision::{
    upsert_env_lines, ConfigFileStatus, EnvironmentProvisioner, PythonVersion, OLLAMA_HOST_KEY,
    OLLAMA_MODEL_KEY,
};
