//! # lens_core
//!
//! Core failure handling for the LogicLens service supervisor.
//!
//! This crate holds the pieces every other crate shares: the error catalog,
//! the classifier that maps raw failures onto it, the runtime configuration,
//! and the recovery dispatcher with its remedy registry.
//!
//! # Architecture
//!
//! - **Catalog**: fixed set of coded errors grouped by category
//! - **Classifier**: pure keyword rules from raw failure to code
//! - **Registry**: maps codes to remedy implementations
//! - **Dispatcher**: reports errors and runs each remedy at most once per context
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lens_core::{Classifier, Failure, RecoveryDispatcher, RemedyRegistry, RuntimeConfig, TracingSink};
//!
//! let mut registry = RemedyRegistry::new();
//! registry.register(Arc::new(MyPortRemedy));
//!
//! let dispatcher = RecoveryDispatcher::new(Arc::new(registry), Arc::new(TracingSink));
//! let error = Classifier::default().classify(&Failure::os("Address in use"), Some("socket bind"));
//! let outcome = dispatcher.handle(&error, Some("socket bind"), &RuntimeConfig::default()).await;
//! ```

pub mod catalog;
pub mod classify;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod ledger;
pub mod remedy;
pub mod sink;

// Re-export main types for convenience
pub use catalog::{ErrorCategory, ErrorCode};
pub use classify::Classifier;
pub use config::{
    executable_name, ConfigPatch, OllamaConfig, RuntimeConfig, ServiceConfig, TimeoutConfig,
};
pub use diagnostics::{DiagnosticsReport, EnvironmentProbe};
pub use dispatcher::{RecoveryDispatcher, RecoveryOutcome};
pub use error::{CoreError, CoreResult};
pub use failure::{Failure, FailureKind, LensError, StepError, StepResult};
pub use ledger::{RecoveryKey, RecoveryLedger, SharedLedger};
pub use remedy::{Remedy, RemedyOutcome, RemedyRegistry};
pub use sink::{DiagnosticsSink, MemorySink, Severity, SharedSink, SinkEntry, TracingSink};
