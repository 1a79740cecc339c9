//! Error types for teegate-gate.

use std::sync::Arc;

use teegate_attestation::{AttestationError, ValidationReport};
use thiserror::Error;

use crate::state::GateState;

/// Errors returned by the secure gate.
///
/// `Clone` so one in-flight verification result can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// A sensitive operation was attempted while the gate was not verified.
    #[error("sensitive operation '{operation}' denied: gate is {state} ({})", describe_report(.last_report.as_deref()))]
    NotVerified {
        /// The denied operation.
        operation: String,
        /// Gate state at the time of the attempt.
        state: GateState,
        /// Most recent validation report, if any.
        last_report: Option<Arc<ValidationReport>>,
    },

    /// Validation failed and the gate is rejected until reset.
    #[error("attestation rejected: {}", .report.summary())]
    Rejected {
        /// The failing report.
        report: Arc<ValidationReport>,
    },

    /// The in-flight verification was cancelled (invalidate, shutdown).
    #[error("verification cancelled")]
    Cancelled,

    /// Automatic re-verification stopped after too many consecutive source failures.
    #[error("re-verification halted after {failures} consecutive source failures: {last_error}")]
    InterventionRequired {
        /// Number of consecutive failures.
        failures: u32,
        /// The most recent failure.
        last_error: AttestationError,
    },

    /// An attestation-level failure (source unavailable, I/O).
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    /// Invalid gate configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// Whether retrying later may succeed without operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Attestation(err) => err.is_retryable(),
            Self::Cancelled => true,
            _ => false,
        }
    }
}

fn describe_report(report: Option<&ValidationReport>) -> String {
    report.map_or_else(|| "no verification attempted".to_string(), ValidationReport::summary)
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
