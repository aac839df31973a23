//! Structured error taxonomy for the core.
//!
//! Every variant carries its own inputs rather than a formatted string, so
//! callers can match on `kind` instead of parsing messages. A [`Recipe`]'s
//! terminal error is shared by every one of its (deduplicated, possibly
//! many) parents, so errors are stored and propagated as `Arc<DrydockError>`.
//!
//! [`Recipe`]: crate::graph::Recipe

use std::sync::Arc;
use thiserror::Error;

/// The error type returned by every fallible operation in `drydock-core`.
#[derive(Debug, Error)]
pub enum DrydockError {
    #[error("command `{cmd}` not found in package `{pkg}`")]
    CommandNotFound { pkg: String, cmd: String },

    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("run-condition evaluation failed: {0}")]
    ConditionEvalError(String),

    #[error("{} dependencies failed", .rest.len() + 1)]
    DependencyFailure {
        #[source]
        first: Arc<DrydockError>,
        rest: Vec<Arc<DrydockError>>,
    },

    #[error("canceled: {reason}")]
    Canceled { reason: String },

    #[error("no plugin registered for runner type `{runner_type}`")]
    RunnerLookupError { runner_type: String },

    #[error("task exited with non-zero code {exit_code}")]
    TaskCrashed { exit_code: i32 },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("workspace config error: {0}")]
    ConfigError(String),

    #[error("plugin host error: {0}")]
    PluginHostError(String),

    #[error("plugin `{plugin}` does not support capability `{capability}`")]
    NotSupported { plugin: String, capability: String },

    #[error("task protocol violation: {0}")]
    ProtocolViolation(String),
}

impl DrydockError {
    /// Build a `DependencyFailure` from one or more child errors, keeping
    /// the first as the primary (chained via `#[source]`) cause and the
    /// rest attached for reporting, per spec §4.E step 3.
    pub fn dependency_failure(mut causes: Vec<Arc<DrydockError>>) -> Arc<DrydockError> {
        assert!(!causes.is_empty(), "dependency_failure requires >=1 cause");
        let first = causes.remove(0);
        Arc::new(DrydockError::DependencyFailure { first, rest: causes })
    }

    /// True for errors that should trigger fail-fast global cancellation
    /// (spec §4.E step 9, §7).
    pub fn is_fatal_to_graph(&self) -> bool {
        matches!(
            self,
            DrydockError::TaskCrashed { .. } | DrydockError::RunnerLookupError { .. }
        )
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, DrydockError>;
