//! Attestation validation.
//!
//! [`AttestationValidator::validate`] runs seven ordered checks and always runs all
//! of them, so the [`ValidationReport`] is complete even when an early check fails:
//!
//! 1. structural - required fields, 64-hex measurement values
//! 2. measurement equality against the reference preset
//! 3. user-data binding (skipped when no expectation is supplied)
//! 4. job binding (skipped when no expectation is supplied)
//! 5. temporal freshness (max age, clock skew)
//! 6. network membership in the allow-list
//! 7. trust-root quote verification
//!
//! When the structural check fails every later check reports `not_applicable`
//! instead of evaluating malformed input.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::hex_digest_eq;
use crate::error::{AttestationError, Result};
use crate::network::Network;
use crate::quote::QuoteVerifier;
use crate::record::AttestationRecord;
use crate::reference::{ExpectedMeasurements, PresetId};

/// Regex for a 32-byte digest rendered as hex.
static MEASUREMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap_or_else(|_| unreachable!()));

/// Whether `value` is a 64-character hex string (case-insensitive).
#[must_use]
pub fn is_measurement_hex(value: &str) -> bool {
    MEASUREMENT_REGEX.is_match(value)
}

/// Default maximum record age: 24 hours.
pub const DEFAULT_MAX_RECORD_AGE_SECS: i64 = 24 * 60 * 60;

/// Default tolerance for records timestamped slightly in the future.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 30;

/// Tunables for the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Oldest acceptable record.
    pub max_record_age: Duration,
    /// How far in the future a record timestamp may lie.
    pub clock_skew: Duration,
    /// Networks a record may target.
    pub allowed_networks: BTreeSet<Network>,
    /// Fail when the quote cannot be checked (no signature, verifier unavailable).
    pub require_quote: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_record_age: Duration::seconds(DEFAULT_MAX_RECORD_AGE_SECS),
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
            allowed_networks: Network::KNOWN.into_iter().collect(),
            require_quote: true,
        }
    }
}

impl ValidatorConfig {
    /// Restrict the allow-list to `networks`.
    #[must_use]
    pub fn with_allowed_networks(mut self, networks: impl IntoIterator<Item = Network>) -> Self {
        self.allowed_networks = networks.into_iter().collect();
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` for a non-positive max age, a negative skew,
    /// an empty allow-list or an unlisted network in the allow-list.
    pub fn validate(&self) -> Result<()> {
        if self.max_record_age <= Duration::zero() {
            return Err(AttestationError::Config(
                "max_record_age must be greater than 0".to_string(),
            ));
        }
        if self.clock_skew < Duration::zero() {
            return Err(AttestationError::Config(
                "clock_skew cannot be negative".to_string(),
            ));
        }
        if self.allowed_networks.is_empty() {
            return Err(AttestationError::Config(
                "allowed_networks cannot be empty".to_string(),
            ));
        }
        if let Some(unknown) = self.allowed_networks.iter().find(|n| !n.is_known()) {
            return Err(AttestationError::Config(format!(
                "'{unknown}' is not a known network"
            )));
        }
        Ok(())
    }
}

/// Name of one validation check, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    /// Required fields and hex format.
    Structural,
    /// Equality with the reference preset.
    MeasurementEquality,
    /// Deployment-descriptor digest binding.
    UserDataBinding,
    /// Job identifier binding.
    JobBinding,
    /// Record age and clock skew.
    TemporalFreshness,
    /// Network allow-list membership.
    NetworkMembership,
    /// Trust-root quote verification.
    QuoteVerification,
}

impl CheckName {
    /// All checks in execution order.
    pub const ALL: [Self; 7] = [
        Self::Structural,
        Self::MeasurementEquality,
        Self::UserDataBinding,
        Self::JobBinding,
        Self::TemporalFreshness,
        Self::NetworkMembership,
        Self::QuoteVerification,
    ];

    /// Stable snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::MeasurementEquality => "measurement_equality",
            Self::UserDataBinding => "user_data_binding",
            Self::JobBinding => "job_binding",
            Self::TemporalFreshness => "temporal_freshness",
            Self::NetworkMembership => "network_membership",
            Self::QuoteVerification => "quote_verification",
        }
    }
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The check passed.
    Pass,
    /// The check failed.
    Fail,
    /// The check was deliberately not run (no expectation supplied).
    Skipped,
    /// The check could not run because the record is structurally invalid.
    NotApplicable,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
            Self::NotApplicable => "not_applicable",
        };
        write!(f, "{s}")
    }
}

/// One line of a validation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Which check.
    pub check: CheckName,
    /// How it went.
    pub outcome: CheckOutcome,
    /// Human-readable detail.
    pub detail: String,
    /// The categorized failure, present only when `outcome` is `Fail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttestationError>,
}

impl CheckResult {
    fn pass(check: CheckName, detail: impl Into<String>) -> Self {
        Self {
            check,
            outcome: CheckOutcome::Pass,
            detail: detail.into(),
            error: None,
        }
    }

    fn skipped(check: CheckName, detail: impl Into<String>) -> Self {
        Self {
            check,
            outcome: CheckOutcome::Skipped,
            detail: detail.into(),
            error: None,
        }
    }

    fn not_applicable(check: CheckName) -> Self {
        Self {
            check,
            outcome: CheckOutcome::NotApplicable,
            detail: "structural check failed".to_string(),
            error: None,
        }
    }

    fn fail(check: CheckName, error: AttestationError) -> Self {
        Self {
            check,
            outcome: CheckOutcome::Fail,
            detail: error.to_string(),
            error: Some(error),
        }
    }
}

/// Complete, ordered outcome of one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Job id from the record, when one could be read.
    pub job_id: Option<String>,
    /// Reference preset the record was compared against.
    pub preset: Option<PresetId>,
    /// Verification time the checks were evaluated at.
    pub validated_at: DateTime<Utc>,
    /// Per-check results in execution order.
    pub checks: Vec<CheckResult>,
    /// AND of every non-skipped check.
    pub overall: bool,
}

impl ValidationReport {
    fn from_checks(
        job_id: Option<String>,
        preset: Option<PresetId>,
        validated_at: DateTime<Utc>,
        checks: Vec<CheckResult>,
    ) -> Self {
        let overall = !checks.is_empty()
            && checks
                .iter()
                .filter(|c| c.outcome != CheckOutcome::Skipped)
                .all(|c| c.outcome == CheckOutcome::Pass);
        Self {
            job_id,
            preset,
            validated_at,
            checks,
            overall,
        }
    }

    /// Report for input that could not even be parsed into a record.
    #[must_use]
    pub fn malformed(detail: impl Into<String>, validated_at: DateTime<Utc>) -> Self {
        let mut checks = vec![CheckResult::fail(
            CheckName::Structural,
            AttestationError::MalformedRecord(detail.into()),
        )];
        checks.extend(
            CheckName::ALL
                .iter()
                .skip(1)
                .map(|name| CheckResult::not_applicable(*name)),
        );
        Self::from_checks(None, None, validated_at, checks)
    }

    /// Result of a named check.
    #[must_use]
    pub fn check(&self, name: CheckName) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == name)
    }

    /// Outcome of a named check.
    #[must_use]
    pub fn outcome(&self, name: CheckName) -> Option<CheckOutcome> {
        self.check(name).map(|c| c.outcome)
    }

    /// Failed checks in order.
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.outcome == CheckOutcome::Fail)
    }

    /// The most severe failure, earliest first among equals.
    #[must_use]
    pub fn primary_error(&self) -> Option<&AttestationError> {
        self.failures()
            .filter_map(|c| c.error.as_ref())
            .fold(None, |best: Option<&AttestationError>, err| match best {
                Some(b) if b.severity() >= err.severity() => Some(b),
                _ => Some(err),
            })
    }

    /// One-line summary, e.g. `rejected: measurement_equality=fail, network_membership=fail`.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.overall {
            return "verified".to_string();
        }
        let failed: Vec<String> = self
            .checks
            .iter()
            .filter(|c| matches!(c.outcome, CheckOutcome::Fail | CheckOutcome::NotApplicable))
            .map(|c| format!("{}={}", c.check, c.outcome))
            .collect();
        format!("rejected: {}", failed.join(", "))
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::MalformedRecord` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AttestationError::MalformedRecord(format!("serialization failed: {e}")))
    }
}

/// A record that passed every non-skipped check. Only the validator creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAttestation {
    record: AttestationRecord,
    report: ValidationReport,
}

impl VerifiedAttestation {
    /// The validated record.
    #[must_use]
    pub const fn record(&self) -> &AttestationRecord {
        &self.record
    }

    /// The report that admitted it.
    #[must_use]
    pub const fn report(&self) -> &ValidationReport {
        &self.report
    }

    /// When it was verified.
    #[must_use]
    pub const fn verified_at(&self) -> DateTime<Utc> {
        self.report.validated_at
    }

    /// Age of the underlying evidence at `now`.
    #[must_use]
    pub fn record_age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.record.timestamp())
    }

    /// Serialize with `attestation_verified: true`.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::MalformedRecord` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        self.record.to_json_with_flag(true)
    }
}

/// Outcome of [`AttestationValidator::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every non-skipped check passed.
    Verified(VerifiedAttestation),
    /// At least one check failed.
    Rejected(ValidationReport),
}

impl Verdict {
    /// The report either way.
    #[must_use]
    pub const fn report(&self) -> &ValidationReport {
        match self {
            Self::Verified(v) => &v.report,
            Self::Rejected(r) => r,
        }
    }

    /// Whether the record was verified.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Verified(_))
    }
}

/// Runs the ordered check pipeline. Stateless apart from its configuration;
/// identical arguments always produce identical reports.
#[derive(Clone)]
pub struct AttestationValidator {
    config: ValidatorConfig,
    quote_verifier: Arc<dyn QuoteVerifier>,
}

impl fmt::Debug for AttestationValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationValidator")
            .field("config", &self.config)
            .field("quote_verifier", &self.quote_verifier.name())
            .finish()
    }
}

impl AttestationValidator {
    /// Create a validator.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` if `config` is invalid.
    pub fn new(config: ValidatorConfig, quote_verifier: Arc<dyn QuoteVerifier>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            quote_verifier,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate `record` and return the full report.
    #[must_use]
    pub fn validate(
        &self,
        record: &AttestationRecord,
        expected: &ExpectedMeasurements,
        expected_user_data: Option<&str>,
        expected_job_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> ValidationReport {
        let structural = check_structure(record);
        let structurally_sound = structural.outcome == CheckOutcome::Pass;
        let mut checks = vec![structural];

        if structurally_sound {
            checks.push(check_measurements(record, expected));
            checks.push(check_user_data(record, expected_user_data));
            checks.push(check_job(record, expected_job_id));
            checks.push(self.check_freshness(record, now));
            checks.push(self.check_network(record));
            checks.push(self.check_quote(record));
        } else {
            checks.extend(
                CheckName::ALL
                    .iter()
                    .skip(1)
                    .map(|name| CheckResult::not_applicable(*name)),
            );
        }

        for failure in checks.iter().filter(|c| c.outcome == CheckOutcome::Fail) {
            warn!(
                job_id = %record.job_id(),
                check = %failure.check,
                detail = %failure.detail,
                "attestation check failed"
            );
        }

        let report = ValidationReport::from_checks(
            Some(record.job_id().to_string()),
            Some(expected.preset().clone()),
            now,
            checks,
        );
        debug!(
            job_id = %record.job_id(),
            preset = %expected.preset(),
            overall = report.overall,
            claimed_verified = record.claimed_verified(),
            "validation complete"
        );
        report
    }

    /// Validate and, on success, wrap the record as a [`VerifiedAttestation`].
    #[must_use]
    pub fn verify(
        &self,
        record: AttestationRecord,
        expected: &ExpectedMeasurements,
        expected_user_data: Option<&str>,
        expected_job_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Verdict {
        let report = self.validate(&record, expected, expected_user_data, expected_job_id, now);
        if report.overall {
            Verdict::Verified(VerifiedAttestation { record, report })
        } else {
            Verdict::Rejected(report)
        }
    }

    fn check_freshness(&self, record: &AttestationRecord, now: DateTime<Utc>) -> CheckResult {
        let age = now.signed_duration_since(record.timestamp());
        if age < -self.config.clock_skew {
            return CheckResult::fail(
                CheckName::TemporalFreshness,
                AttestationError::ClockSkew {
                    ahead_secs: -age.num_seconds(),
                    tolerance_secs: self.config.clock_skew.num_seconds(),
                },
            );
        }
        if age > self.config.max_record_age {
            return CheckResult::fail(
                CheckName::TemporalFreshness,
                AttestationError::Expired {
                    age_secs: age.num_seconds(),
                    max_age_secs: self.config.max_record_age.num_seconds(),
                },
            );
        }
        CheckResult::pass(
            CheckName::TemporalFreshness,
            format!("age {}s", age.num_seconds().max(0)),
        )
    }

    fn check_network(&self, record: &AttestationRecord) -> CheckResult {
        let network = record.network();
        if self.config.allowed_networks.contains(network) {
            return CheckResult::pass(CheckName::NetworkMembership, network.to_string());
        }
        let detail = if network.is_known() {
            format!("network '{network}' is not in the allow-list")
        } else {
            format!("network '{network}' is not a known network")
        };
        CheckResult::fail(
            CheckName::NetworkMembership,
            AttestationError::UnknownNetwork(detail),
        )
    }

    fn check_quote(&self, record: &AttestationRecord) -> CheckResult {
        let Some(signature) = record.signature() else {
            return if self.config.require_quote {
                CheckResult::fail(
                    CheckName::QuoteVerification,
                    AttestationError::QuoteVerificationFailed(
                        "record carries no signature".to_string(),
                    ),
                )
            } else {
                CheckResult::skipped(CheckName::QuoteVerification, "no signature; quote not required")
            };
        };

        match self
            .quote_verifier
            .verify_quote(&record.quote_payload(), signature)
        {
            Ok(true) => CheckResult::pass(
                CheckName::QuoteVerification,
                format!("accepted by {} verifier", self.quote_verifier.name()),
            ),
            Ok(false) => CheckResult::fail(
                CheckName::QuoteVerification,
                AttestationError::QuoteVerificationFailed(format!(
                    "rejected by {} verifier",
                    self.quote_verifier.name()
                )),
            ),
            Err(unavailable) if self.config.require_quote => CheckResult::fail(
                CheckName::QuoteVerification,
                AttestationError::QuoteVerificationFailed(unavailable.to_string()),
            ),
            Err(unavailable) => {
                CheckResult::skipped(CheckName::QuoteVerification, unavailable.to_string())
            }
        }
    }
}

fn check_structure(record: &AttestationRecord) -> CheckResult {
    let mut problems = Vec::new();
    if record.job_id().trim().is_empty() {
        problems.push("job_id is empty".to_string());
    }
    if record.measurements().is_empty() {
        problems.push("no measurements".to_string());
    }
    for (name, value) in record.measurements() {
        if !is_measurement_hex(value) {
            problems.push(format!("measurement '{name}' is not a 64-character hex digest"));
        }
    }
    if let Some(digest) = record.user_data_digest() {
        if !is_measurement_hex(digest) {
            problems.push("user_data_digest is not a 64-character hex digest".to_string());
        }
    }

    if problems.is_empty() {
        CheckResult::pass(
            CheckName::Structural,
            format!("{} measurements well-formed", record.measurements().len()),
        )
    } else {
        CheckResult::fail(
            CheckName::Structural,
            AttestationError::MalformedRecord(problems.join("; ")),
        )
    }
}

fn check_measurements(record: &AttestationRecord, expected: &ExpectedMeasurements) -> CheckResult {
    let actual = record.measurements();
    let mut mismatches = Vec::new();
    for (name, want) in expected.measurements() {
        match actual.get(name) {
            None => mismatches.push(format!("{name} missing")),
            Some(got) if !got.eq_ignore_ascii_case(want) => {
                mismatches.push(format!("{name} expected {}.. got {}..", prefix(want), prefix(got)));
            }
            Some(_) => {}
        }
    }

    let extra: Vec<&str> = actual
        .keys()
        .filter(|k| !expected.measurements().contains_key(*k))
        .map(String::as_str)
        .collect();
    if !extra.is_empty() {
        warn!(
            job_id = %record.job_id(),
            preset = %expected.preset(),
            extra = ?extra,
            "record carries measurements outside the reference preset"
        );
    }

    if !mismatches.is_empty() {
        return CheckResult::fail(
            CheckName::MeasurementEquality,
            AttestationError::MeasurementMismatch(mismatches.join("; ")),
        );
    }

    let mut detail = format!(
        "{} registers match preset {}",
        expected.measurements().len(),
        expected.preset()
    );
    if !extra.is_empty() {
        detail.push_str(&format!("; extra registers tolerated: {}", extra.join(", ")));
    }
    CheckResult::pass(CheckName::MeasurementEquality, detail)
}

fn check_user_data(record: &AttestationRecord, expected: Option<&str>) -> CheckResult {
    let Some(expected) = expected else {
        return CheckResult::skipped(CheckName::UserDataBinding, "no expected user data supplied");
    };
    match record.user_data_digest() {
        Some(actual) if hex_digest_eq(actual, expected) => {
            CheckResult::pass(CheckName::UserDataBinding, "user data digest matches")
        }
        Some(actual) => CheckResult::fail(
            CheckName::UserDataBinding,
            AttestationError::BindingMismatch(format!(
                "user_data_digest {}.. does not match expected {}..",
                prefix(actual),
                prefix(expected)
            )),
        ),
        None => CheckResult::fail(
            CheckName::UserDataBinding,
            AttestationError::BindingMismatch("record carries no user_data_digest".to_string()),
        ),
    }
}

fn check_job(record: &AttestationRecord, expected: Option<&str>) -> CheckResult {
    let Some(expected) = expected else {
        return CheckResult::skipped(CheckName::JobBinding, "no expected job id supplied");
    };
    if record.job_id() == expected {
        CheckResult::pass(CheckName::JobBinding, "job id matches")
    } else {
        CheckResult::fail(
            CheckName::JobBinding,
            AttestationError::BindingMismatch(format!(
                "job_id '{}' does not match expected '{expected}'",
                record.job_id()
            )),
        )
    }
}

fn prefix(value: &str) -> &str {
    value.get(..16).unwrap_or(value)
}
