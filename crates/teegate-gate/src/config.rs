//! Gate configuration.
//!
//! Loaded from a TOML file with four sections:
//! - `[source]`: where records come from
//! - `[validation]`: validator limits and the trust root
//! - `[gate]`: freshness budget and re-verification schedule
//! - `[binding]`: reference preset and deployment bindings

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use teegate_attestation::{
    AttestationValidator, DigestComputer, Ed25519QuoteVerifier, InMemoryReferenceStore, Network,
    PresetId, QuoteVerifier, ReferenceMeasurementStore, UnavailableQuoteVerifier, ValidatorConfig, is_measurement_hex,
};
use tracing::warn;

use crate::audit::TracingAuditLogger;
use crate::error::{GateError, Result};
use crate::gate::{GateSettings, SecureGate, VerificationPolicy};
use crate::reverify::ReverifyConfig;
use crate::source::ConfiguredSource;

/// Commented sample written by `teegate init-config`.
pub const SAMPLE_CONFIG: &str = r#"# teegate configuration

[source]
# Base URL of the enclave attestation service; the record is read from {endpoint}/attestation.
endpoint = "http://127.0.0.1:8090"
# Application URL used for the liveness probe (GET / must return 200).
app_url = "http://127.0.0.1:3000"
# Previously persisted record, used when the endpoint is unreachable.
persisted_record = "/var/lib/teegate/attestation.json"
request_timeout_secs = 10

[validation]
max_record_age_secs = 86400
clock_skew_secs = 30
allowed_networks = ["arbitrum-mainnet", "base-mainnet"]
require_quote = true
# Hex-encoded Ed25519 trust-root key. Without one, quote verification is unavailable.
# trust_root_public_key = ""

[gate]
freshness_budget_secs = 3600
recheck_interval_secs = 60
jitter_secs = 10
max_consecutive_failures = 5
persist_verified_to = "/var/lib/teegate/attestation.json"

[binding]
preset = "arm64/v1.0.0"
reference_file = "config/reference-measurements.toml"
# descriptor_path = "docker-compose.yml"
# expected_job_id = ""
"#;

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the attestation service.
    pub endpoint: Option<String>,
    /// Application URL for liveness probes.
    pub app_url: Option<String>,
    /// Persisted record used as a fallback.
    pub persisted_record: Option<PathBuf>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            app_url: None,
            persisted_record: None,
            request_timeout_secs: 10,
        }
    }
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Maximum record age in seconds.
    pub max_record_age_secs: u64,
    /// Tolerated clock skew for future timestamps, in seconds.
    pub clock_skew_secs: u64,
    /// Allow-listed network names.
    pub allowed_networks: Vec<String>,
    /// Whether a missing or unverifiable quote fails validation.
    pub require_quote: bool,
    /// Hex-encoded Ed25519 trust-root key.
    pub trust_root_public_key: Option<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_record_age_secs: 86_400,
            clock_skew_secs: 30,
            allowed_networks: Network::KNOWN.iter().map(|n| n.as_str().to_string()).collect(),
            require_quote: true,
            trust_root_public_key: None,
        }
    }
}

/// `[gate]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// How long a verification is trusted, in seconds.
    pub freshness_budget_secs: u64,
    /// Base interval of the background re-verifier, in seconds.
    pub recheck_interval_secs: u64,
    /// Maximum random delay added to each interval, in seconds.
    pub jitter_secs: u64,
    /// Consecutive source failures before automatic retries stop.
    pub max_consecutive_failures: u32,
    /// Where to persist the last verified record.
    pub persist_verified_to: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            freshness_budget_secs: 3_600,
            recheck_interval_secs: 60,
            jitter_secs: 10,
            max_consecutive_failures: 5,
            persist_verified_to: None,
        }
    }
}

/// `[binding]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BindingConfig {
    /// Reference preset, `arch/version`.
    pub preset: String,
    /// Reference measurement TOML file.
    pub reference_file: PathBuf,
    /// Deployment descriptor whose digest is the expected user data.
    pub descriptor_path: Option<PathBuf>,
    /// Explicit expected user-data digest.
    pub expected_user_data: Option<String>,
    /// Expected job id.
    pub expected_job_id: Option<String>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            preset: "arm64/v1.0.0".to_string(),
            reference_file: PathBuf::from("config/reference-measurements.toml"),
            descriptor_path: None,
            expected_user_data: None,
            expected_job_id: None,
        }
    }
}

/// Complete gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateConfig {
    /// Record sources.
    #[serde(default)]
    pub source: SourceConfig,
    /// Validator settings.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Freshness and scheduling.
    #[serde(default)]
    pub gate: ScheduleConfig,
    /// Preset and bindings.
    #[serde(default)]
    pub binding: BindingConfig,
}

fn config_err(e: impl std::fmt::Display) -> GateError {
    GateError::Config(e.to_string())
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GateError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| GateError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range or malformed.
    pub fn validate(&self) -> Result<()> {
        if self.source.request_timeout_secs == 0 {
            return Err(config_err("source.request_timeout_secs must be greater than 0"));
        }
        if let Some(endpoint) = &self.source.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(config_err(format!(
                    "source.endpoint must be an http(s) URL, got '{endpoint}'"
                )));
            }
        }

        if self.validation.max_record_age_secs == 0 {
            return Err(config_err("validation.max_record_age_secs must be greater than 0"));
        }
        for name in &self.validation.allowed_networks {
            if !Network::parse(name).is_known() {
                return Err(config_err(format!(
                    "validation.allowed_networks: unknown network '{name}'"
                )));
            }
        }
        if let Some(key) = &self.validation.trust_root_public_key {
            Ed25519QuoteVerifier::from_hex(key).map_err(config_err)?;
        }

        if self.gate.freshness_budget_secs == 0 {
            return Err(config_err("gate.freshness_budget_secs must be greater than 0"));
        }
        if self.gate.recheck_interval_secs == 0 {
            return Err(config_err("gate.recheck_interval_secs must be greater than 0"));
        }
        if self.gate.jitter_secs >= self.gate.recheck_interval_secs {
            return Err(config_err(
                "gate.jitter_secs must be smaller than gate.recheck_interval_secs",
            ));
        }
        if self.gate.max_consecutive_failures == 0 {
            return Err(config_err("gate.max_consecutive_failures must be greater than 0"));
        }

        self.binding.preset.parse::<PresetId>().map_err(config_err)?;
        if let Some(digest) = &self.binding.expected_user_data {
            if !is_measurement_hex(digest) {
                return Err(config_err(
                    "binding.expected_user_data must be a 64-character hex digest",
                ));
            }
            if self.binding.descriptor_path.is_some() {
                return Err(config_err(
                    "binding.expected_user_data and binding.descriptor_path are mutually exclusive",
                ));
            }
        }

        Ok(())
    }

    /// Validator limits from `[validation]`.
    ///
    /// # Errors
    ///
    /// Returns an error if a duration overflows or a network is unknown.
    pub fn validator_config(&self) -> Result<ValidatorConfig> {
        let secs = |v: u64| {
            i64::try_from(v)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .ok_or_else(|| config_err(format!("duration of {v}s is out of range")))
        };
        let config = ValidatorConfig {
            max_record_age: secs(self.validation.max_record_age_secs)?,
            clock_skew: secs(self.validation.clock_skew_secs)?,
            require_quote: self.validation.require_quote,
            ..ValidatorConfig::default()
        }
        .with_allowed_networks(self.validation.allowed_networks.iter().map(|n| Network::parse(n)));
        config.validate().map_err(config_err)?;
        Ok(config)
    }

    /// The trust-root verifier. Without a configured key, quote verification is unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed.
    pub fn quote_verifier(&self) -> Result<Arc<dyn QuoteVerifier>> {
        match &self.validation.trust_root_public_key {
            Some(key) => Ok(Arc::new(Ed25519QuoteVerifier::from_hex(key).map_err(config_err)?)),
            None => {
                if self.validation.require_quote {
                    warn!("no trust_root_public_key configured; every record will fail quote verification");
                }
                Ok(Arc::new(UnavailableQuoteVerifier))
            }
        }
    }

    /// The validator described by `[validation]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the validator settings are invalid.
    pub fn validator(&self) -> Result<AttestationValidator> {
        AttestationValidator::new(self.validator_config()?, self.quote_verifier()?)
            .map_err(config_err)
    }

    /// Load the reference measurement file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid, or lacks the configured preset.
    pub fn reference_store(&self) -> Result<InMemoryReferenceStore> {
        let store =
            InMemoryReferenceStore::from_file(&self.binding.reference_file).map_err(config_err)?;
        let preset: PresetId = self.binding.preset.parse().map_err(config_err)?;
        if store.expected(&preset).is_none() {
            return Err(config_err(format!(
                "reference file '{}' has no preset {preset}",
                self.binding.reference_file.display()
            )));
        }
        Ok(store)
    }

    /// Preset and bindings from `[binding]`; digests the descriptor if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset is malformed or the descriptor cannot be read.
    pub fn verification_policy(&self) -> Result<VerificationPolicy> {
        let preset: PresetId = self.binding.preset.parse().map_err(config_err)?;
        let expected_user_data = match (&self.binding.descriptor_path, &self.binding.expected_user_data)
        {
            (Some(path), _) => Some(DigestComputer::new().digest_file(path)?),
            (None, Some(digest)) => Some(digest.to_ascii_lowercase()),
            (None, None) => None,
        };
        let mut policy = VerificationPolicy::new(preset);
        if let Some(digest) = expected_user_data {
            policy = policy.with_expected_user_data(digest);
        }
        if let Some(job_id) = &self.binding.expected_job_id {
            policy = policy.with_expected_job_id(job_id.clone());
        }
        Ok(policy)
    }

    /// Gate freshness and failure settings from `[gate]`.
    #[must_use]
    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            freshness_budget: i64::try_from(self.gate.freshness_budget_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            max_consecutive_failures: self.gate.max_consecutive_failures,
            persist_verified_to: self.gate.persist_verified_to.clone(),
        }
    }

    /// Background schedule from `[gate]`.
    #[must_use]
    pub const fn reverify_config(&self) -> ReverifyConfig {
        ReverifyConfig {
            interval: Duration::from_secs(self.gate.recheck_interval_secs),
            jitter: Duration::from_secs(self.gate.jitter_secs),
        }
    }

    /// The record source from `[source]`.
    ///
    /// # Errors
    ///
    /// Returns an error if no source is configured.
    pub fn build_source(&self) -> Result<ConfiguredSource> {
        ConfiguredSource::from_config(&self.source).map_err(config_err)
    }

    /// Assemble a gate from every section, auditing through `tracing`.
    ///
    /// # Errors
    ///
    /// Returns the first error from the individual builders.
    pub fn build_gate(&self) -> Result<SecureGate<ConfiguredSource>> {
        Ok(SecureGate::new(
            self.build_source()?,
            self.validator()?,
            Arc::new(self.reference_store()?),
            self.verification_policy()?,
            self.gate_settings(),
        )
        .with_audit_logger(Arc::new(TracingAuditLogger::new())))
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(config_err)
    }
}
