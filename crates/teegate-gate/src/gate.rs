//! The secure gate.
//!
//! [`SecureGate`] owns the verification state machine an agent consults before a
//! sensitive operation. It fails closed: only a fresh, verified record permits
//! anything.
//!
//! At most one fetch + validate cycle runs per gate. Callers that ask for
//! verification while a cycle is in flight wait on a `watch` channel for its
//! result. State lives behind a `parking_lot::RwLock` that is never held across
//! an `.await`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use teegate_attestation::{
    AttestationError, AttestationValidator, PresetId, ReferenceMeasurementStore, ValidationReport,
    Verdict, VerifiedAttestation,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditLogger, NoopAuditLogger};
use crate::error::{GateError, Result};
use crate::source::AttestationSource;
use crate::state::{GatePermit, GateSnapshot, GateState};

/// What a record must be bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPolicy {
    /// Reference preset to compare measurements against.
    pub preset: PresetId,
    /// Expected user-data digest; the binding check is skipped when `None`.
    pub expected_user_data: Option<String>,
    /// Expected job id; the job check is skipped when `None`.
    pub expected_job_id: Option<String>,
}

impl VerificationPolicy {
    /// Policy with no bindings.
    #[must_use]
    pub const fn new(preset: PresetId) -> Self {
        Self {
            preset,
            expected_user_data: None,
            expected_job_id: None,
        }
    }

    /// Require this user-data digest.
    #[must_use]
    pub fn with_expected_user_data(mut self, digest: impl Into<String>) -> Self {
        self.expected_user_data = Some(digest.into());
        self
    }

    /// Require this job id.
    #[must_use]
    pub fn with_expected_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.expected_job_id = Some(job_id.into());
        self
    }
}

/// Freshness and failure handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    /// How long after verification a record may back sensitive operations.
    pub freshness_budget: Duration,
    /// Consecutive source failures after which automatic retries stop.
    pub max_consecutive_failures: u32,
    /// Where to write each newly verified record.
    pub persist_verified_to: Option<PathBuf>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            freshness_budget: Duration::hours(1),
            max_consecutive_failures: 5,
            persist_verified_to: None,
        }
    }
}

type VerifyOutcome = Result<Arc<VerifiedAttestation>>;

struct InFlight {
    cancel: CancellationToken,
    result: watch::Receiver<Option<VerifyOutcome>>,
}

struct Inner {
    state: GateState,
    verified: Option<Arc<VerifiedAttestation>>,
    last_report: Option<Arc<ValidationReport>>,
    consecutive_failures: u32,
    // Bumped on every cycle start and every invalidation; a cycle only commits
    // if the generation is still its own.
    generation: u64,
    in_flight: Option<InFlight>,
}

struct Cycle {
    generation: u64,
    prior: GateState,
    cancel: CancellationToken,
    result: watch::Sender<Option<VerifyOutcome>>,
}

enum Start {
    Done(VerifyOutcome),
    Wait(watch::Receiver<Option<VerifyOutcome>>),
    Run(Cycle),
}

enum CycleOutcome {
    Verified(VerifiedAttestation),
    Rejected(ValidationReport),
    SourceFailed(AttestationError),
    Misconfigured(String),
    Cancelled,
}

enum Effect {
    Audit(AuditEvent),
    Persist(PathBuf, Arc<VerifiedAttestation>),
}

/// Resets the gate if a cycle's future is dropped before it commits.
struct CycleGuard<'a> {
    inner: &'a RwLock<Inner>,
    generation: u64,
    armed: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.write();
        if inner.generation == self.generation {
            inner.state = GateState::Unverified;
            inner.verified = None;
            inner.in_flight = None;
            warn!(
                generation = self.generation,
                "verification abandoned before completion; gate reset to unverified"
            );
        }
    }
}

/// Verification state machine guarding sensitive operations.
pub struct SecureGate<S> {
    source: S,
    validator: AttestationValidator,
    references: Arc<dyn ReferenceMeasurementStore>,
    policy: VerificationPolicy,
    settings: GateSettings,
    audit: Arc<dyn AuditLogger>,
    inner: RwLock<Inner>,
}

impl<S: AttestationSource> fmt::Debug for SecureGate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SecureGate")
            .field("source", &self.source.describe())
            .field("preset", &self.policy.preset)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl<S: AttestationSource> SecureGate<S> {
    /// Create a gate in `Unverified`. Audit events are discarded until a logger is set.
    #[must_use]
    pub fn new(
        source: S,
        validator: AttestationValidator,
        references: Arc<dyn ReferenceMeasurementStore>,
        policy: VerificationPolicy,
        settings: GateSettings,
    ) -> Self {
        Self {
            source,
            validator,
            references,
            policy,
            settings,
            audit: Arc::new(NoopAuditLogger),
            inner: RwLock::new(Inner {
                state: GateState::Unverified,
                verified: None,
                last_report: None,
                consecutive_failures: 0,
                generation: 0,
                in_flight: None,
            }),
        }
    }

    /// Deliver rejection events to `audit`.
    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// The record source.
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// The binding policy.
    pub const fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// The freshness and failure settings.
    pub const fn settings(&self) -> &GateSettings {
        &self.settings
    }

    fn is_fresh(&self, verified: &VerifiedAttestation, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(verified.verified_at()) <= self.settings.freshness_budget
            && verified.record_age_at(now) <= self.validator.config().max_record_age
    }

    fn effective_state(&self, inner: &Inner, now: DateTime<Utc>) -> GateState {
        match (inner.state, &inner.verified) {
            (GateState::Verified, Some(verified)) if self.is_fresh(verified, now) => {
                GateState::Verified
            }
            (GateState::Verified, _) => GateState::Stale,
            (state, _) => state,
        }
    }

    /// Current state. A verified record past its budget reads as `Stale`.
    pub fn current_state(&self) -> GateState {
        self.current_state_at(Utc::now())
    }

    /// Current state as of `now`.
    pub fn current_state_at(&self, now: DateTime<Utc>) -> GateState {
        self.effective_state(&self.inner.read(), now)
    }

    /// Report from the most recent completed validation.
    pub fn last_report(&self) -> Option<Arc<ValidationReport>> {
        self.inner.read().last_report.clone()
    }

    /// The retained verified attestation, even if stale. Not a permit.
    pub fn verified_attestation(&self) -> Option<Arc<VerifiedAttestation>> {
        self.inner.read().verified.clone()
    }

    /// Consecutive source failures since the last completed validation.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().consecutive_failures
    }

    /// Whether automatic re-verification has stopped until [`Self::reset`].
    pub fn requires_intervention(&self) -> bool {
        self.inner.read().consecutive_failures >= self.settings.max_consecutive_failures
    }

    /// True only while `Verified` with a record inside its freshness budget.
    pub fn may_perform_sensitive_operation(&self) -> bool {
        self.may_perform_sensitive_operation_at(Utc::now())
    }

    /// [`Self::may_perform_sensitive_operation`] as of `now`.
    pub fn may_perform_sensitive_operation_at(&self, now: DateTime<Utc>) -> bool {
        self.current_state_at(now) == GateState::Verified
    }

    /// Authorize `operation`, or explain why it is denied.
    ///
    /// # Errors
    ///
    /// Returns `GateError::NotVerified` with the current state and last report
    /// when the gate does not hold a fresh verified record.
    pub fn authorize(&self, operation: &str) -> Result<GatePermit> {
        self.authorize_at(operation, Utc::now())
    }

    /// [`Self::authorize`] as of `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::authorize`].
    pub fn authorize_at(&self, operation: &str, now: DateTime<Utc>) -> Result<GatePermit> {
        let inner = self.inner.read();
        let state = self.effective_state(&inner, now);
        if let (GateState::Verified, Some(verified)) = (state, &inner.verified) {
            return Ok(GatePermit {
                operation: operation.to_string(),
                job_id: verified.record().job_id().to_string(),
                verified_at: verified.verified_at(),
                granted_at: now,
            });
        }
        let last_report = inner.last_report.clone();
        drop(inner);
        warn!(operation, state = %state, "sensitive operation denied");
        Err(GateError::NotVerified {
            operation: operation.to_string(),
            state,
            last_report,
        })
    }

    /// Run `f` only if `operation` is authorized.
    ///
    /// # Errors
    ///
    /// Returns `GateError::NotVerified` without calling `f` when denied.
    pub fn run_sensitive<T>(&self, operation: &str, f: impl FnOnce(&GatePermit) -> T) -> Result<T> {
        let permit = self.authorize(operation)?;
        debug!(operation, job_id = %permit.job_id, "sensitive operation permitted");
        Ok(f(&permit))
    }

    /// Commit a time-driven `Verified -> Stale` transition, returning the state.
    pub fn refresh(&self) -> GateState {
        self.refresh_at(Utc::now())
    }

    /// [`Self::refresh`] as of `now`.
    pub fn refresh_at(&self, now: DateTime<Utc>) -> GateState {
        let mut inner = self.inner.write();
        let effective = self.effective_state(&inner, now);
        if inner.state == GateState::Verified && effective == GateState::Stale {
            inner.state = GateState::Stale;
            if let Some(verified) = &inner.verified {
                info!(
                    job_id = %verified.record().job_id(),
                    verified_at = %verified.verified_at(),
                    "verified attestation went stale"
                );
            }
        }
        effective
    }

    /// Consistent view of the whole gate.
    pub fn snapshot(&self) -> GateSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// [`Self::snapshot`] as of `now`.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> GateSnapshot {
        let inner = self.inner.read();
        GateSnapshot {
            state: self.effective_state(&inner, now),
            last_report: inner.last_report.clone(),
            verified: inner.verified.clone(),
            consecutive_failures: inner.consecutive_failures,
            requires_intervention: inner.consecutive_failures
                >= self.settings.max_consecutive_failures,
            taken_at: now,
        }
    }

    fn invalidate_locked(inner: &mut Inner) -> GateState {
        let prior = inner.state;
        inner.generation += 1;
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.cancel.cancel();
        }
        inner.state = GateState::Unverified;
        inner.verified = None;
        inner.consecutive_failures = 0;
        prior
    }

    /// Drop any trust and go to `Unverified` from any state, cancelling an
    /// in-flight verification. Waiters on that verification get `Cancelled`.
    pub fn invalidate(&self, reason: &str) {
        let prior = Self::invalidate_locked(&mut self.inner.write());
        info!(reason, prior = %prior, "gate invalidated");
    }

    /// Operator reset out of `Rejected` or a halted retry loop.
    ///
    /// Returns `false` and changes nothing if neither applies.
    pub fn reset(&self) -> bool {
        let mut inner = self.inner.write();
        let halted = inner.consecutive_failures >= self.settings.max_consecutive_failures;
        if inner.state != GateState::Rejected && !halted {
            return false;
        }
        let prior = Self::invalidate_locked(&mut inner);
        drop(inner);
        info!(prior = %prior, halted, "gate reset by operator");
        true
    }

    /// Cancel the in-flight verification, if any. The gate ends up `Unverified`.
    pub fn cancel_verification(&self) -> bool {
        let inner = self.inner.read();
        inner.in_flight.as_ref().is_some_and(|in_flight| {
            in_flight.cancel.cancel();
            true
        })
    }

    /// Request verification.
    ///
    /// - `Unverified` / `Stale`: runs a fetch + validate cycle.
    /// - `Verifying`: waits for the in-flight cycle instead of starting another.
    /// - `Verified`: returns the cached attestation.
    /// - `Rejected`: fails until [`Self::reset`].
    ///
    /// # Errors
    ///
    /// `Rejected` on validation failure, `Attestation(SourceUnavailable)` or
    /// `InterventionRequired` when the source cannot be reached, `Config` when the
    /// preset is unknown, `Cancelled` if the cycle was cancelled.
    pub async fn verify(&self) -> Result<Arc<VerifiedAttestation>> {
        let start = {
            let mut inner = self.inner.write();
            let now = Utc::now();
            match self.effective_state(&inner, now) {
                GateState::Verified => match inner.verified.clone() {
                    Some(verified) => Start::Done(Ok(verified)),
                    None => Start::Run(Self::begin_cycle(&mut inner, GateState::Unverified)),
                },
                GateState::Rejected => {
                    let report = inner.last_report.clone().unwrap_or_else(|| {
                        Arc::new(ValidationReport::malformed("rejected without a report", now))
                    });
                    Start::Done(Err(GateError::Rejected { report }))
                }
                GateState::Verifying => match inner.in_flight.as_ref().map(|f| f.result.clone()) {
                    Some(result) => Start::Wait(result),
                    None => Start::Run(Self::begin_cycle(&mut inner, GateState::Unverified)),
                },
                prior @ (GateState::Unverified | GateState::Stale) => {
                    Start::Run(Self::begin_cycle(&mut inner, prior))
                }
            }
        };

        match start {
            Start::Done(outcome) => outcome,
            Start::Wait(result) => Self::await_in_flight(result).await,
            Start::Run(cycle) => self.run_cycle(cycle).await,
        }
    }

    fn begin_cycle(inner: &mut Inner, prior: GateState) -> Cycle {
        inner.generation += 1;
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        inner.in_flight = Some(InFlight {
            cancel: cancel.clone(),
            result: rx,
        });
        inner.state = GateState::Verifying;
        Cycle {
            generation: inner.generation,
            prior,
            cancel,
            result: tx,
        }
    }

    async fn await_in_flight(mut result: watch::Receiver<Option<VerifyOutcome>>) -> VerifyOutcome {
        let outcome = match result.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(GateError::Cancelled))
    }

    async fn run_cycle(&self, cycle: Cycle) -> VerifyOutcome {
        let Cycle {
            generation,
            prior,
            cancel,
            result,
        } = cycle;
        debug!(
            generation,
            prior = %prior,
            source = %self.source.describe(),
            "verification started"
        );

        let mut guard = CycleGuard {
            inner: &self.inner,
            generation,
            armed: true,
        };
        let outcome = tokio::select! {
            () = cancel.cancelled() => CycleOutcome::Cancelled,
            outcome = self.fetch_and_validate() => outcome,
        };
        guard.armed = false;

        let (outcome, effect) = self.complete(generation, prior, outcome);
        result.send_replace(Some(outcome.clone()));

        match effect {
            Some(Effect::Audit(event)) => self.audit.log(&event),
            Some(Effect::Persist(path, verified)) => persist_verified(&path, &verified).await,
            None => {}
        }
        outcome
    }

    async fn fetch_and_validate(&self) -> CycleOutcome {
        let fetched = self.source.fetch().await;
        let now = Utc::now();
        let record = match fetched {
            Ok(record) => record,
            Err(AttestationError::MalformedRecord(detail)) => {
                return CycleOutcome::Rejected(ValidationReport::malformed(detail, now));
            }
            Err(AttestationError::Config(detail)) => return CycleOutcome::Misconfigured(detail),
            Err(err) => return CycleOutcome::SourceFailed(err),
        };

        let Some(expected) = self.references.expected(&self.policy.preset) else {
            return CycleOutcome::Misconfigured(format!(
                "no reference measurements for preset {}",
                self.policy.preset
            ));
        };

        match self.validator.verify(
            record,
            &expected,
            self.policy.expected_user_data.as_deref(),
            self.policy.expected_job_id.as_deref(),
            now,
        ) {
            Verdict::Verified(verified) => CycleOutcome::Verified(verified),
            Verdict::Rejected(report) => CycleOutcome::Rejected(report),
        }
    }

    fn complete(
        &self,
        generation: u64,
        prior: GateState,
        outcome: CycleOutcome,
    ) -> (VerifyOutcome, Option<Effect>) {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            debug!(generation, "verification superseded by invalidation");
            return (Err(GateError::Cancelled), None);
        }
        inner.in_flight = None;

        match outcome {
            CycleOutcome::Verified(verified) => {
                let verified = Arc::new(verified);
                inner.state = GateState::Verified;
                inner.verified = Some(Arc::clone(&verified));
                inner.last_report = Some(Arc::new(verified.report().clone()));
                inner.consecutive_failures = 0;
                info!(
                    job_id = %verified.record().job_id(),
                    prior = %prior,
                    network = %verified.record().network(),
                    "attestation verified"
                );
                let effect = self
                    .settings
                    .persist_verified_to
                    .clone()
                    .map(|path| Effect::Persist(path, Arc::clone(&verified)));
                (Ok(verified), effect)
            }
            CycleOutcome::Rejected(report) => {
                let event = AuditEvent::attestation_rejected(report.clone(), prior);
                let report = Arc::new(report);
                inner.state = GateState::Rejected;
                inner.verified = None;
                inner.last_report = Some(Arc::clone(&report));
                inner.consecutive_failures = 0;
                error!(
                    job_id = report.job_id.as_deref().unwrap_or("-"),
                    prior = %prior,
                    summary = %report.summary(),
                    "attestation rejected"
                );
                (Err(GateError::Rejected { report }), Some(Effect::Audit(event)))
            }
            CycleOutcome::SourceFailed(err) => {
                inner.state = prior;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                let failures = inner.consecutive_failures;
                if failures >= self.settings.max_consecutive_failures {
                    error!(
                        failures,
                        state = %prior,
                        error = %err,
                        "attestation source unavailable; automatic re-verification halted"
                    );
                    (
                        Err(GateError::InterventionRequired {
                            failures,
                            last_error: err,
                        }),
                        None,
                    )
                } else {
                    warn!(failures, state = %prior, error = %err, "attestation source unavailable");
                    (Err(GateError::Attestation(err)), None)
                }
            }
            CycleOutcome::Misconfigured(detail) => {
                inner.state = prior;
                error!(state = %prior, %detail, "verification could not run");
                (Err(GateError::Config(detail)), None)
            }
            CycleOutcome::Cancelled => {
                inner.state = GateState::Unverified;
                inner.verified = None;
                info!(generation, "verification cancelled");
                (Err(GateError::Cancelled), None)
            }
        }
    }
}

async fn persist_verified(path: &Path, verified: &VerifiedAttestation) {
    let result = match verified.to_json() {
        Ok(json) => write_atomically(path, json.as_bytes()).await,
        Err(e) => Err(std::io::Error::other(e.to_string())),
    };
    match result {
        Ok(()) => debug!(path = %path.display(), "persisted verified record"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to persist verified record"),
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
