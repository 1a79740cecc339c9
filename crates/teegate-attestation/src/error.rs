//! Error types for teegate-attestation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How serious a failure is for diagnostics and audit routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    /// Transient, does not by itself imply compromise.
    Transient,
    /// Fatal validation failure.
    Fatal,
    /// Trust-root rejection; the highest severity.
    Critical,
}

/// Errors that can occur in attestation operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AttestationError {
    /// The record is structurally invalid (missing fields, bad hex, bad timestamp).
    #[error("malformed attestation record: {0}")]
    MalformedRecord(String),

    /// A platform measurement does not match the reference value.
    #[error("measurement mismatch: {0}")]
    MeasurementMismatch(String),

    /// The record is bound to a different deployment descriptor or job.
    #[error("binding mismatch: {0}")]
    BindingMismatch(String),

    /// The record is older than the freshness budget.
    #[error("attestation expired: age {age_secs}s exceeds max {max_age_secs}s")]
    Expired {
        /// Age of the record in seconds.
        age_secs: i64,
        /// The maximum allowed age in seconds.
        max_age_secs: i64,
    },

    /// The record's timestamp lies in the future beyond the skew tolerance.
    #[error("clock skew: record timestamp is {ahead_secs}s ahead of verifier clock (tolerance {tolerance_secs}s)")]
    ClockSkew {
        /// How far ahead of the verifier the record claims to be.
        ahead_secs: i64,
        /// The configured tolerance in seconds.
        tolerance_secs: i64,
    },

    /// The record targets a network outside the allow-list.
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    /// The attestation source could not be reached or returned no usable answer.
    #[error("attestation source unavailable: {0}")]
    SourceUnavailable(String),

    /// The trust-root verifier rejected the quote, or was unavailable when required.
    #[error("quote verification failed: {0}")]
    QuoteVerificationFailed(String),

    /// Reading digest input or a persisted record failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// Invalid configuration (reference store, validator settings).
    #[error("configuration error: {0}")]
    Config(String),
}

impl AttestationError {
    /// Returns `true` only for failures worth retrying on the next cycle.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }

    /// Severity of this failure.
    #[must_use]
    pub const fn severity(&self) -> FailureSeverity {
        match self {
            Self::SourceUnavailable(_) | Self::Io(_) | Self::Config(_) => {
                FailureSeverity::Transient
            }
            Self::QuoteVerificationFailed(_) => FailureSeverity::Critical,
            _ => FailureSeverity::Fatal,
        }
    }
}

impl From<std::io::Error> for AttestationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for attestation operations.
pub type Result<T> = std::result::Result<T, AttestationError>;
