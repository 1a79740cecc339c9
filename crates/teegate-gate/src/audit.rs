//! Security audit trail for the gate.
//!
//! A rejected attestation is the one security-relevant event the gate emits
//! outside its own state. Destinations plug in through [`AuditLogger`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use teegate_attestation::{AttestationError, FailureSeverity, ValidationReport};
use uuid::Uuid;

use crate::state::GateState;

/// How serious a rejection is, taken from the primary error of its report.
///
/// Also usable as the threshold for [`AuditLogger::log_if_severe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A content check failed: structure, measurements, bindings, freshness or network.
    High,
    /// The trust root refused the quote.
    Critical,
}

impl Severity {
    /// Returns the string representation of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn for_report(report: &ValidationReport) -> Self {
        match report.primary_error().map(AttestationError::severity) {
            Some(FailureSeverity::Critical) => Self::Critical,
            _ => Self::High,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Security audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Validation failed and the gate moved to `Rejected`.
    AttestationRejected {
        /// Unique event identifier.
        event_id: Uuid,
        /// When the event occurred.
        timestamp: DateTime<Utc>,
        /// Severity level.
        severity: Severity,
        /// State the gate was in before the failed cycle.
        prior_state: GateState,
        /// The full failing report.
        report: ValidationReport,
    },
}

impl AuditEvent {
    /// Build a rejection event for `report`.
    #[must_use]
    pub fn attestation_rejected(report: ValidationReport, prior_state: GateState) -> Self {
        Self::AttestationRejected {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::for_report(&report),
            prior_state,
            report,
        }
    }

    /// Returns the event ID.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        match self {
            Self::AttestationRejected { event_id, .. } => *event_id,
        }
    }

    /// Returns the event timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AttestationRejected { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the event severity.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::AttestationRejected { severity, .. } => *severity,
        }
    }

    /// Returns the event type as a string.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::AttestationRejected { .. } => "attestation_rejected",
        }
    }

    /// The validation report carried by the event.
    #[must_use]
    pub const fn report(&self) -> &ValidationReport {
        match self {
            Self::AttestationRejected { report, .. } => report,
        }
    }

    /// Serializes the event to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Trait for audit logging backends.
pub trait AuditLogger: Send + Sync {
    /// Logs an audit event.
    fn log(&self, event: &AuditEvent);

    /// Logs an audit event if the severity is at or above the minimum.
    fn log_if_severe(&self, event: &AuditEvent, min_severity: Severity) {
        if event.severity() >= min_severity {
            self.log(event);
        }
    }
}

impl<T: AuditLogger + ?Sized> AuditLogger for Arc<T> {
    fn log(&self, event: &AuditEvent) {
        (**self).log(event);
    }
}

/// Audit logger that writes to `tracing` under the `teegate_audit` target.
///
/// Critical events go out at error level, High at warn.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditLogger {
    prefix: Option<String>,
}

impl TracingAuditLogger {
    /// Creates a new tracing-based audit logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new tracing-based audit logger with a prefix.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: &AuditEvent) {
        let event_id = event.event_id();
        let event_type = event.event_type();
        let severity = event.severity();
        let job_id = event.report().job_id.as_deref().unwrap_or("-");
        let summary = event.report().summary();
        let json = event.to_json().unwrap_or_else(|_| "{}".to_string());
        let prefix = self.prefix.as_deref().unwrap_or("AUDIT");

        if severity == Severity::Critical {
            tracing::error!(
                target: "teegate_audit",
                %event_id,
                %event_type,
                %severity,
                %job_id,
                event_json = %json,
                "[{prefix}] {summary}"
            );
        } else {
            tracing::warn!(
                target: "teegate_audit",
                %event_id,
                %event_type,
                %severity,
                %job_id,
                event_json = %json,
                "[{prefix}] {summary}"
            );
        }
    }
}

/// A no-op audit logger for disabled scenarios.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn log(&self, _event: &AuditEvent) {}
}

/// Keeps events in memory; lets callers and tests inspect what was emitted.
#[derive(Debug, Default)]
pub struct MemoryAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLogger {
    /// Creates an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events logged so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of events logged so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}
