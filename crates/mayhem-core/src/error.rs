//! ---
//! mayhem_section: "07-fault-injection"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Error taxonomy for the orchestration core."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
use std::collections::TryReserveError;
use std::path::PathBuf;

use crate::ledger::ExperimentId;
use crate::scenario::ResourceKind;

/// Bounds accepted for `duration` in seconds.
pub const MIN_DURATION_SECS: i64 = 1;
pub const MAX_DURATION_SECS: i64 = 300;

/// Synchronous rejection of a malformed injection request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error(
        "duration must be between {} and {} seconds, got {}",
        MIN_DURATION_SECS,
        MAX_DURATION_SECS,
        .0
    )]
    DurationOutOfRange(i64),
    #[error("intensity must be one of low, medium, high, got '{0}'")]
    UnknownIntensity(String),
}

impl ValidationError {
    /// Stable machine-readable label used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::UnknownScenario(_) => "unknown_scenario",
            ValidationError::DurationOutOfRange(_) => "invalid_duration",
            ValidationError::UnknownIntensity(_) => "invalid_intensity",
        }
    }
}

/// Everything `ChaosInjectionEngine::inject` can reject synchronously.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{kind} workloads are saturated ({limit} already running)")]
    Saturated { kind: ResourceKind, limit: usize },
    #[error("injection task ended before the experiment was recorded")]
    Interrupted,
}

/// Failures of the experiment ledger or its backing store. Never fatal for
/// an injection; the engine logs them and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger actor is not running")]
    Unavailable,
    #[error("experiment {0} not found")]
    NotFound(ExperimentId),
    #[error("ledger store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ledger store rejected the write: {0}")]
    Store(String),
}

/// Failure inside a dispatched workload. Captured into the experiment's
/// terminal state, never returned to the caller of `inject`.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("allocation failed after {allocated_chunks} chunks: {source}")]
    Allocation {
        allocated_chunks: u64,
        #[source]
        source: TryReserveError,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("scratch file {} could not be written: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scratch directory {} could not be prepared: {source}", .path.display())]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cleanup left {} artifact(s) behind: {}", .0.len(), .0.join("; "))]
    Cleanup(Vec<String>),
    #[error("{primary}; additionally cleanup failed: {}", .cleanup.join("; "))]
    WriteAndCleanup {
        primary: Box<WorkloadError>,
        cleanup: Vec<String>,
    },
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Host metrics could not be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("system metrics unavailable: {message}")]
pub struct MetricsUnavailableError {
    pub message: String,
}

impl MetricsUnavailableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
