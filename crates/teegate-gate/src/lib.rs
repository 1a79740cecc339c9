//! # teegate-gate
//!
//! The secure gate an agent consults before sensitive operations such as
//! private-key use or transaction signing.
//!
//! This crate provides:
//!
//! - [`SecureGate`] - verification state machine with single-flight verification
//! - [`AttestationSource`] - HTTP, file and fallback record sources
//! - [`spawn_reverifier`] - background freshness timer and re-verification
//! - [`AuditLogger`] - destinations for the rejection audit event
//! - [`GateConfig`] - TOML configuration assembling all of the above
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use teegate_gate::{GateConfig, spawn_reverifier};
//!
//! # async fn run() -> Result<(), teegate_gate::GateError> {
//! let config = GateConfig::from_file("teegate.toml")?;
//! let gate = Arc::new(config.build_gate()?);
//! let handle = spawn_reverifier(Arc::clone(&gate), config.reverify_config());
//!
//! let signature = gate.run_sensitive("sign_transaction", |permit| {
//!     format!("signed under {}", permit.job_id)
//! })?;
//! # let _ = signature;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod reverify;
pub mod source;
pub mod state;

pub use audit::{
    AuditEvent, AuditLogger, MemoryAuditLogger, NoopAuditLogger, Severity, TracingAuditLogger,
};
pub use config::{
    BindingConfig, GateConfig, SAMPLE_CONFIG, ScheduleConfig, SourceConfig, ValidationConfig,
};
pub use error::{GateError, Result};
pub use gate::{GateSettings, SecureGate, VerificationPolicy};
pub use reverify::{ReverifierHandle, ReverifyConfig, spawn_reverifier};
pub use source::{
    AttestationSource, ConfiguredSource, DEFAULT_MAX_BODY_BYTES, FallbackSource, FileAttestationSource,
    HttpAttestationSource, probe_liveness,
};
pub use state::{GatePermit, GateSnapshot, GateState};
