//! Diagnostics sink: where operator-facing messages go.
//!
//! The supervisor never prints directly. Everything it wants the operator to
//! see is handed to a [`DiagnosticsSink`] with a severity; production code
//! forwards to `tracing`, tests capture into a [`MemorySink`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Receiver of operator-facing messages.
pub trait DiagnosticsSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    fn success(&self, message: &str) {
        self.log(Severity::Success, message);
    }

    fn warn(&self, message: &str) {
        self.log(Severity::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn DiagnosticsSink>;

/// Sink forwarding to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => tracing::info!(target: "logiclens", "{}", message),
            Severity::Success => tracing::info!(target: "logiclens", success = true, "{}", message),
            Severity::Warning => tracing::warn!(target: "logiclens", "{}", message),
            Severity::Error => tracing::error!(target: "logiclens", "{}", message),
        }
    }
}

/// A captured message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEntry {
    pub severity: Severity,
    pub message: String,
}

/// Sink that keeps every message in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<RwLock<Vec<SinkEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured messages, oldest first.
    pub fn entries(&self) -> Vec<SinkEntry> {
        self.entries.read().clone()
    }

    /// Whether any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.read().iter().any(|e| e.message.contains(needle))
    }

    /// Number of messages at `severity` containing `needle`.
    pub fn count(&self, severity: Severity, needle: &str) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.severity == severity && e.message.contains(needle))
            .count()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl DiagnosticsSink for MemorySink {
    fn log(&self, severity: Severity, message: &str) {
        self.entries.write().push(SinkEntry {
            severity,
            message: message.to_string(),
        });
    }
}
