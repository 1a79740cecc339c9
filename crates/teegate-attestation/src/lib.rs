//! # teegate-attestation
//!
//! Verification of remote attestation records produced by a trusted execution
//! environment.
//!
//! This crate provides:
//!
//! - [`DigestComputer`] - SHA-256 digests binding a record to a deployment descriptor
//! - [`AttestationRecord`] - strongly typed, immutable attestation evidence
//! - [`ReferenceMeasurementStore`] - known-good measurements per build preset
//! - [`QuoteVerifier`] - pluggable trust-root check of the vendor quote
//! - [`AttestationValidator`] - the ordered check pipeline producing a [`ValidationReport`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{Duration, Utc};
//! use teegate_attestation::{
//!     AttestationRecord, AttestationValidator, ExpectedMeasurements, FixedQuoteVerifier,
//!     Measurements, Network, PresetId, ValidatorConfig,
//! };
//!
//! let pcr0 = "0d8c50f0d0e9ecf25c48ba9ed1d8d5dc475be1dba553a0ef299f385bd7447220";
//! let mut reference = Measurements::new();
//! reference.insert("pcr0".to_string(), pcr0.to_string());
//! let expected = ExpectedMeasurements::new(PresetId::new("arm64", "v1.0.0"), reference).unwrap();
//!
//! let now = Utc::now();
//! let record = AttestationRecord::builder()
//!     .job_id("job-1")
//!     .measurement("pcr0", pcr0)
//!     .timestamp(now - Duration::hours(1))
//!     .network(Network::ArbitrumMainnet)
//!     .signature(vec![0u8; 64])
//!     .build()
//!     .unwrap();
//!
//! let validator = AttestationValidator::new(
//!     ValidatorConfig::default(),
//!     Arc::new(FixedQuoteVerifier::accepting()),
//! )
//! .unwrap();
//! let report = validator.validate(&record, &expected, None, None, now);
//! assert!(report.overall);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod digest;
pub mod error;
pub mod network;
pub mod quote;
pub mod record;
pub mod reference;
pub mod validator;

pub use digest::{DigestComputer, hex_digest_eq};
pub use error::{AttestationError, FailureSeverity, Result};
pub use network::Network;
pub use quote::{
    Ed25519QuoteVerifier, FixedQuoteVerifier, QuoteUnavailable, QuoteVerifier,
    UnavailableQuoteVerifier,
};
pub use record::{AttestationRecord, AttestationRecordBuilder, Measurements};
pub use reference::{
    ExpectedMeasurements, InMemoryReferenceStore, PresetId, ReferenceMeasurementStore,
};
pub use validator::{
    AttestationValidator, CheckName, CheckOutcome, CheckResult, ValidationReport,
    ValidatorConfig, Verdict, VerifiedAttestation, is_measurement_hex,
};
