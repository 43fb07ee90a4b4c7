//! The fixed error catalog.
//!
//! Every failure the supervisor reports is mapped to exactly one of these
//! codes. Codes are grouped by prefix into categories; the descriptions are
//! the operator-facing text used when a structured error carries no message
//! of its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Category of an error code, derived from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Environment,
    Dependency,
    Process,
    Configuration,
    Application,
    ExternalService,
    System,
}

impl ErrorCategory {
    /// Code prefix shared by every code in this category.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Environment => "ENV",
            Self::Dependency => "DEP",
            Self::Process => "PRC",
            Self::Configuration => "CFG",
            Self::Application => "APP",
            Self::ExternalService => "OLM",
            Self::System => "SYS",
        }
    }

    /// Whether errors in this category warrant a diagnostics dump.
    pub fn wants_diagnostics(&self) -> bool {
        matches!(self, Self::Environment | Self::System)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Environment => "environment",
            Self::Dependency => "dependency",
            Self::Process => "process",
            Self::Configuration => "configuration",
            Self::Application => "application",
            Self::ExternalService => "external-service",
            Self::System => "system",
        };
        write!(f, "{}", name)
    }
}

/// A coded error from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorCode {
    /// Interpreter version incompatible.
    Env001,
    /// Isolated environment creation failed.
    Env002,
    /// Isolated environment activation failed.
    Env003,
    /// Required directory not found.
    Env004,
    /// Insufficient permissions.
    Env005,
    /// Installer (pip) missing from the isolated environment.
    Dep001,
    /// Dependency installation failed.
    Dep002,
    /// Package metadata preparation failed.
    Dep003,
    /// Development-mode install failed.
    Dep004,
    /// Port already in use.
    Prc001,
    /// Process termination failed.
    Prc002,
    /// Server process not found.
    Prc003,
    /// Process launched but terminated unexpectedly.
    Prc004,
    /// Local configuration file creation failed.
    Cfg001,
    /// Configuration template not found.
    Cfg002,
    /// Invalid configuration in the local configuration file.
    Cfg003,
    /// Server application failed to start.
    App001,
    /// Test data generation failed.
    App002,
    /// Logging system initialization failed.
    App003,
    /// Database connection failed.
    App004,
    /// Insufficient disk space.
    Sys001,
    /// Insufficient memory.
    Sys002,
    /// Network connectivity issue.
    Sys003,
    /// System command execution failed.
    Sys004,
    /// Inference backend not running or unreachable.
    Olm001,
    /// Inference model not found.
    Olm002,
    /// Inference backend request timeout.
    Olm003,
    /// Inference backend API error.
    Olm004,
    /// Inference backend installation issue.
    Olm005,
}

impl ErrorCode {
    /// Every code in the catalog, in catalog order.
    pub const ALL: [ErrorCode; 29] = [
        Self::Env001,
        Self::Env002,
        Self::Env003,
        Self::Env004,
        Self::Env005,
        Self::Dep001,
        Self::Dep002,
        Self::Dep003,
        Self::Dep004,
        Self::Prc001,
        Self::Prc002,
        Self::Prc003,
        Self::Prc004,
        Self::Cfg001,
        Self::Cfg002,
        Self::Cfg003,
        Self::App001,
        Self::App002,
        Self::App003,
        Self::App004,
        Self::Sys001,
        Self::Sys002,
        Self::Sys003,
        Self::Sys004,
        Self::Olm001,
        Self::Olm002,
        Self::Olm003,
        Self::Olm004,
        Self::Olm005,
    ];

    /// The catalog identifier, e.g. `PRC_001`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env001 => "ENV_001",
            Self::Env002 => "ENV_002",
            Self::Env003 => "ENV_003",
            Self::Env004 => "ENV_004",
            Self::Env005 => "ENV_005",
            Self::Dep001 => "DEP_001",
            Self::Dep002 => "DEP_002",
            Self::Dep003 => "DEP_003",
            Self::Dep004 => "DEP_004",
            Self::Prc001 => "PRC_001",
            Self::Prc002 => "PRC_002",
            Self::Prc003 => "PRC_003",
            Self::Prc004 => "PRC_004",
            Self::Cfg001 => "CFG_001",
            Self::Cfg002 => "CFG_002",
            Self::Cfg003 => "CFG_003",
            Self::App001 => "APP_001",
            Self::App002 => "APP_002",
            Self::App003 => "APP_003",
            Self::App004 => "APP_004",
            Self::Sys001 => "SYS_001",
            Self::Sys002 => "SYS_002",
            Self::Sys003 => "SYS_003",
            Self::Sys004 => "SYS_004",
            Self::Olm001 => "OLM_001",
            Self::Olm002 => "OLM_002",
            Self::Olm003 => "OLM_003",
            Self::Olm004 => "OLM_004",
            Self::Olm005 => "OLM_005",
        }
    }

    /// Human-readable description from the catalog.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Env001 => "Python version incompatible (requires 3.8+)",
            Self::Env002 => "Virtual environment creation failed",
            Self::Env003 => "Virtual environment activation failed",
            Self::Env004 => "Required directory not found",
            Self::Env005 => "Insufficient permissions",
            Self::Dep001 => "Pip not found in virtual environment",
            Self::Dep002 => "Dependency installation failed",
            Self::Dep003 => "Package metadata preparation failed",
            Self::Dep004 => "Package installation in development mode failed",
            Self::Prc001 => "Port already in use",
            Self::Prc002 => "Process termination failed",
            Self::Prc003 => "Flask process not found",
            Self::Prc004 => "Process launched but terminated unexpectedly",
            Self::Cfg001 => ".env file creation failed",
            Self::Cfg002 => ".env.example file not found",
            Self::Cfg003 => "Invalid configuration in .env file",
            Self::App001 => "Flask application failed to start",
            Self::App002 => "Test data generation failed",
            Self::App003 => "Logging system initialization failed",
            Self::App004 => "Database connection failed",
            Self::Sys001 => "Insufficient disk space",
            Self::Sys002 => "Insufficient memory",
            Self::Sys003 => "Network connectivity issue",
            Self::Sys004 => "System command execution failed",
            Self::Olm001 => "Ollama server not running or unreachable",
            Self::Olm002 => "Ollama model not found or not available",
            Self::Olm003 => "Ollama request timeout",
            Self::Olm004 => "Ollama API error",
            Self::Olm005 => "Ollama installation issue",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Env001 | Self::Env002 | Self::Env003 | Self::Env004 | Self::Env005 => {
                ErrorCategory::Environment
            }
            Self::Dep001 | Self::Dep002 | Self::Dep003 | Self::Dep004 => ErrorCategory::Dependency,
            Self::Prc001 | Self::Prc002 | Self::Prc003 | Self::Prc004 => ErrorCategory::Process,
            Self::Cfg001 | Self::Cfg002 | Self::Cfg003 => ErrorCategory::Configuration,
            Self::App001 | Self::App002 | Self::App003 | Self::App004 => {
                ErrorCategory::Application
            }
            Self::Sys001 | Self::Sys002 | Self::Sys003 | Self::Sys004 => ErrorCategory::System,
            Self::Olm001 | Self::Olm002 | Self::Olm003 | Self::Olm004 | Self::Olm005 => {
                ErrorCategory::ExternalService
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == wanted)
            .ok_or_else(|| CoreError::UnknownCode(s.to_string()))
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

/// Iterate the catalog as `(code, description)` pairs.
pub fn entries() -> impl Iterator<Item = (ErrorCode, &'static str)> {
    ErrorCode::ALL.iter().map(|code| (*code, code.description()))
}
