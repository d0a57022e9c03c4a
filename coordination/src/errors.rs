//! Error taxonomy for the orchestration engine.
//!
//! Quota exhaustion never shows up here: a pool that is out of permits
//! suspends the caller instead of failing. Everything else is classified so
//! callers can tell a hard, run-ending problem from a per-operation one
//! without string matching.
//!
//! | Variant             | Scope          | Fatal to a batch run |
//! |---------------------|----------------|----------------------|
//! | `InvalidBudget`     | configuration  | yes                  |
//! | `Config`            | configuration  | yes                  |
//! | `NoModelsConfigured`| one operation  | no                   |
//! | `AllModelsFailed`   | one operation  | no                   |
//! | `Cancelled`         | caller         | no                   |
//! | `Sink`              | observability  | no (always swallowed)|
//! | `Io`                | observability  | no                   |

use std::fmt;

use thiserror::Error;

/// A single provider failure captured during a consensus round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFailure {
    /// Name of the model that failed.
    pub model_name: String,
    /// Rendered error message returned by the provider call.
    pub message: String,
    /// Dispatch sequence number of the failed call.
    pub sequence: usize,
}

impl fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model_name, self.message)
    }
}

/// Unified error type for pool, consensus and batch operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A permit budget was constructed with impossible limits.
    #[error("Invalid permit budget: {0}")]
    InvalidBudget(String),

    /// Engine configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A consensus call was issued with an empty model list.
    #[error("no models configured for {operation}")]
    NoModelsConfigured { operation: String },

    /// Every model in a consensus round failed.
    #[error("all models failed for {operation}")]
    AllModelsFailed {
        operation: String,
        failures: Vec<ModelFailure>,
    },

    /// The caller's cancellation token fired while suspended.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A divergence sink could not record an entry.
    #[error("Divergence sink error: {0}")]
    Sink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinationError {
    /// Returns `true` for errors that should abort a whole run rather than a
    /// single operation or item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidBudget(_) | Self::Config(_))
    }

    /// Provider failures attached to an `AllModelsFailed` error.
    pub fn model_failures(&self) -> &[ModelFailure] {
        match self {
            Self::AllModelsFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Result type for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
