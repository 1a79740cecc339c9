//! Gate states and read-only views of the gate.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teegate_attestation::{ValidationReport, VerifiedAttestation};

/// Verification state of a [`SecureGate`](crate::SecureGate).
///
/// ```text
/// Unverified --verify--> Verifying --pass--> Verified --budget elapsed--> Stale
///                            |                                             |
///                            +--fail--> Rejected          Stale --verify--> Verifying
/// any --invalidate--> Unverified
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    /// No trusted record. Initial state.
    Unverified,
    /// A fetch + validate cycle is in flight.
    Verifying,
    /// A record passed validation and is within its freshness budget.
    Verified,
    /// The verified record outlived its freshness budget.
    Stale,
    /// Validation failed; terminal until an explicit reset.
    Rejected,
}

impl GateState {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Stale => "stale",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Consistent point-in-time view of the gate, taken under a single lock.
#[derive(Debug, Clone)]
pub struct GateSnapshot {
    /// Effective state at the snapshot time.
    pub state: GateState,
    /// Most recent validation report, if any.
    pub last_report: Option<Arc<ValidationReport>>,
    /// Last verified attestation, retained through `Stale`.
    pub verified: Option<Arc<VerifiedAttestation>>,
    /// Consecutive source failures since the last completed validation.
    pub consecutive_failures: u32,
    /// Whether automatic re-verification has stopped pending operator action.
    pub requires_intervention: bool,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl GateSnapshot {
    /// When the retained record was verified.
    #[must_use]
    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified.as_ref().map(|v| v.verified_at())
    }
}

/// Proof that a sensitive operation was authorized by a verified gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePermit {
    /// Operation the permit was issued for.
    pub operation: String,
    /// Job id of the verified deployment.
    pub job_id: String,
    /// When the backing record was verified.
    pub verified_at: DateTime<Utc>,
    /// When the permit was issued.
    pub granted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(GateState::Unverified, "unverified")]
    #[test_case(GateState::Verifying, "verifying")]
    #[test_case(GateState::Verified, "verified")]
    #[test_case(GateState::Stale, "stale")]
    #[test_case(GateState::Rejected, "rejected")]
    fn state_names(state: GateState, name: &str) {
        assert_eq!(state.to_string(), name);
        let json = serde_json::to_string(&state).expect("serialize");
        assert_eq!(json, format!("\"{name}\""));
    }
}
