//! Background re-verification.
//!
//! A cancellable timer task that commits `Verified -> Stale` transitions and
//! re-verifies stale or unverified gates. It never holds gate locks across the
//! fetch; all state changes go through [`SecureGate`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gate::SecureGate;
use crate::source::AttestationSource;
use crate::state::GateState;

/// Schedule for the background re-verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverifyConfig {
    /// Base interval between checks.
    pub interval: Duration,
    /// Upper bound of the random delay added to each interval.
    pub jitter: Duration,
}

impl Default for ReverifyConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(10),
        }
    }
}

impl ReverifyConfig {
    /// Next delay: the interval plus a uniform jitter in `[0, jitter]`, saturating at
    /// `Duration::MAX`.
    pub fn next_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval
            .saturating_add(Duration::from_millis(rng.gen_range(0..=jitter_ms)))
    }
}

/// Handle for controlling the re-verification task.
#[derive(Debug)]
pub struct ReverifierHandle {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReverifierHandle {
    /// Check if the task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of checks performed so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Signal the task to stop. An in-flight verification is abandoned and the
    /// gate drops to `Unverified`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "re-verifier task ended abnormally");
        }
    }
}

/// Start the background re-verifier for `gate`.
///
/// The first check runs immediately; later ones follow [`ReverifyConfig::next_delay`].
/// Must be called from within a Tokio runtime.
pub fn spawn_reverifier<S>(gate: Arc<SecureGate<S>>, config: ReverifyConfig) -> ReverifierHandle
where
    S: AttestationSource + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let ticks = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let running = Arc::clone(&running);
        let ticks = Arc::clone(&ticks);
        let cancel = cancel.clone();
        async move {
            let mut rng = StdRng::from_entropy();
            info!(
                interval_ms = u64::try_from(config.interval.as_millis()).unwrap_or(u64::MAX),
                jitter_ms = u64::try_from(config.jitter.as_millis()).unwrap_or(u64::MAX),
                "re-verifier started"
            );
            loop {
                ticks.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = check(&gate) => {}
                }
                let delay = config.next_delay(&mut rng);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("re-verifier stopped");
        }
    });

    ReverifierHandle {
        running,
        ticks,
        cancel,
        task,
    }
}

async fn check<S: AttestationSource>(gate: &SecureGate<S>) {
    let state = gate.refresh();
    if gate.requires_intervention() {
        debug!(
            failures = gate.consecutive_failures(),
            "re-verification halted; waiting for operator reset"
        );
        return;
    }
    if !matches!(state, GateState::Unverified | GateState::Stale) {
        return;
    }
    match gate.verify().await {
        Ok(verified) => debug!(job_id = %verified.record().job_id(), "re-verification succeeded"),
        Err(e) => debug!(error = %e, "re-verification failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use teegate_attestation::{
        AttestationError, AttestationRecord, AttestationValidator, ExpectedMeasurements,
        FixedQuoteVerifier, InMemoryReferenceStore, Measurements, Network, PresetId,
        ValidatorConfig,
    };

    use crate::gate::{GateSettings, VerificationPolicy};

    const PCR0: &str = "0d8c50f0d0e9ecf25c48ba9ed1d8d5dc475be1dba553a0ef299f385bd7447220";

    struct StubSource {
        available: bool,
        block: bool,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(available: bool) -> Self {
            Self {
                available,
                block: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AttestationSource for StubSource {
        async fn fetch(&self) -> Result<AttestationRecord, AttestationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block {
                std::future::pending::<()>().await;
            }
            if !self.available {
                return Err(AttestationError::SourceUnavailable("down".into()));
            }
            AttestationRecord::builder()
                .job_id("job-1")
                .measurement("pcr0", PCR0)
                .timestamp(Utc::now() - chrono::Duration::minutes(5))
                .network(Network::BaseMainnet)
                .signature(vec![1u8; 64])
                .build()
        }

        fn describe(&self) -> String {
            "stub".to_string()
        }
    }

    fn gate(source: StubSource, max_failures: u32) -> Arc<SecureGate<StubSource>> {
        let mut measurements = Measurements::new();
        measurements.insert("pcr0".to_string(), PCR0.to_string());
        let mut store = InMemoryReferenceStore::new();
        store
            .insert(
                ExpectedMeasurements::new(PresetId::new("arm64", "v1.0.0"), measurements)
                    .expect("reference"),
            )
            .expect("insert");
        let validator = AttestationValidator::new(
            ValidatorConfig::default(),
            Arc::new(FixedQuoteVerifier::accepting()),
        )
        .expect("validator");
        Arc::new(SecureGate::new(
            source,
            validator,
            Arc::new(store),
            VerificationPolicy::new(PresetId::new("arm64", "v1.0.0")),
            GateSettings {
                max_consecutive_failures: max_failures,
                ..GateSettings::default()
            },
        ))
    }

    fn fast() -> ReverifyConfig {
        ReverifyConfig {
            interval: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        }
    }

    #[test]
    fn default_config() {
        let config = ReverifyConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.jitter, Duration::from_secs(10));
    }

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let config = ReverifyConfig {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(10),
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let delay = config.next_delay(&mut rng);
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(70));
        }

        let no_jitter = ReverifyConfig {
            interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
        };
        assert_eq!(no_jitter.next_delay(&mut rng), Duration::from_secs(5));
    }

    #[test]
    fn huge_interval_saturates() {
        let config = ReverifyConfig {
            interval: Duration::from_secs(u64::MAX),
            jitter: Duration::from_secs(10),
        };
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            assert!(config.next_delay(&mut rng) >= Duration::from_secs(u64::MAX));
        }

        // Same when the interval comes from configuration.
        let mut gate_config = crate::config::GateConfig::default();
        gate_config.gate.recheck_interval_secs = u64::MAX;
        let delay = gate_config.reverify_config().next_delay(&mut rng);
        assert!(delay >= Duration::from_secs(u64::MAX));
    }

    #[tokio::test]
    async fn verifies_unverified_gate() {
        let gate = gate(StubSource::new(true), 5);
        let handle = spawn_reverifier(Arc::clone(&gate), fast());

        for _ in 0..100 {
            if gate.may_perform_sensitive_operation() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(gate.may_perform_sensitive_operation());
        assert!(handle.is_running());

        // A verified gate is left alone.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.source().calls.load(Ordering::SeqCst), 1);
        assert!(handle.ticks() > 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stops_retrying_after_bounded_failures() {
        let gate = gate(StubSource::new(false), 3);
        let handle = spawn_reverifier(Arc::clone(&gate), fast());

        for _ in 0..100 {
            if gate.requires_intervention() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(gate.requires_intervention());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gate.source().calls.load(Ordering::SeqCst), 3);
        assert_eq!(gate.current_state(), GateState::Unverified);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_abandons_in_flight_verification() {
        let mut source = StubSource::new(true);
        source.block = true;
        let gate = gate(source, 5);
        let handle = spawn_reverifier(Arc::clone(&gate), fast());

        for _ in 0..100 {
            if gate.current_state() == GateState::Verifying {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gate.current_state(), GateState::Verifying);

        handle.stop();
        for _ in 0..100 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_running());
        assert_eq!(gate.current_state(), GateState::Unverified);
        handle.shutdown().await;
    }
}
