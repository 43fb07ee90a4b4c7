//! Flat diagnostics reports and the probe interface that produces them.

use async_trait::async_trait;
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::sink::DiagnosticsSink;

/// An ordered list of `label: value` facts about the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    fields: Vec<(String, String)>,
}

impl DiagnosticsReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, value: impl ToString) {
        self.fields.push((label.into(), value.to_string()));
    }

    /// Add a field only when the probe produced a value.
    pub fn push_opt(&mut self, label: impl Into<String>, value: Option<impl ToString>) {
        if let Some(value) = value {
            self.push(label, value);
        }
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Write the report to a sink, one line per field.
    pub fn log_to(&self, sink: &dyn DiagnosticsSink) {
        sink.info("System diagnostics:");
        for (label, value) in &self.fields {
            sink.info(&format!("  {}: {}", label, value));
        }
    }
}

/// Something that can describe the current environment.
///
/// Implementations must never fail: a probe that cannot determine a fact
/// simply leaves it out of the report.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn collect(&self, config: &RuntimeConfig) -> DiagnosticsReport;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_optional_fields_are_skipped() {
        let mut report = DiagnosticsReport::new();
        report.push("OS", "linux 6.1");
        report.push_opt("Disk space", None::<String>);
        report.push_opt("Port 5050 in use", Some(false));

        assert_eq!(report.fields().len(), 2);
        assert_eq!(report.get("Port 5050 in use"), Some("false"));
        assert_eq!(report.get("Disk space"), None);
    }

    #[test]
    fn test_log_to_writes_every_field() {
        let mut report = DiagnosticsReport::new();
        report.push("Current directory", "/srv/app");
        let sink = MemorySink::new();
        report.log_to(&sink);
        assert!(sink.contains("System diagnostics:"));
        assert!(sink.contains("  Current directory: /srv/app"));
    }
}
