//! Trust-root verification of the vendor quote.
//!
//! Quote issuance is an opaque external primitive. The validator only needs a
//! yes/no answer for a (payload, signature) pair, or to learn that no answer can
//! be given at all.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::error::{AttestationError, Result};

/// The verifier could not produce an answer (no trust root, library failure).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("quote verifier unavailable: {0}")]
pub struct QuoteUnavailable(pub String);

/// Capability that checks a quote against the TEE vendor's trust root.
pub trait QuoteVerifier: Send + Sync {
    /// Returns `Ok(true)` if `signature` is a valid trust-root signature over `quote`.
    fn verify_quote(
        &self,
        quote: &[u8],
        signature: &[u8],
    ) -> std::result::Result<bool, QuoteUnavailable>;

    /// Short name for reports and logs.
    fn name(&self) -> &'static str;
}

/// Verifies Ed25519 signatures made by a pinned trust-root key.
#[derive(Debug, Clone)]
pub struct Ed25519QuoteVerifier {
    trust_root: VerifyingKey,
}

impl Ed25519QuoteVerifier {
    /// Create a verifier for the given trust-root key.
    #[must_use]
    pub const fn new(trust_root: VerifyingKey) -> Self {
        Self { trust_root }
    }

    /// Create a verifier from a hex-encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` if the key is not valid hex or not a valid point.
    pub fn from_hex(public_key: &str) -> Result<Self> {
        let bytes = hex::decode(public_key.trim().trim_start_matches("0x"))
            .map_err(|e| AttestationError::Config(format!("trust root key is not hex: {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            AttestationError::Config("trust root key must be 32 bytes".to_string())
        })?;
        let key = VerifyingKey::from_bytes(&arr)
            .map_err(|e| AttestationError::Config(format!("invalid trust root key: {e}")))?;
        Ok(Self::new(key))
    }

    /// The pinned key.
    #[must_use]
    pub const fn trust_root(&self) -> &VerifyingKey {
        &self.trust_root
    }
}

impl QuoteVerifier for Ed25519QuoteVerifier {
    fn verify_quote(
        &self,
        quote: &[u8],
        signature: &[u8],
    ) -> std::result::Result<bool, QuoteUnavailable> {
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return Ok(false);
        };
        let signature = Signature::from_bytes(&bytes);
        Ok(self.trust_root.verify(quote, &signature).is_ok())
    }

    fn name(&self) -> &'static str {
        "ed25519"
    }
}

/// Stands in when no trust root is configured; always unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableQuoteVerifier;

impl QuoteVerifier for UnavailableQuoteVerifier {
    fn verify_quote(
        &self,
        _quote: &[u8],
        _signature: &[u8],
    ) -> std::result::Result<bool, QuoteUnavailable> {
        Err(QuoteUnavailable("no trust root configured".to_string()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

/// Returns a fixed answer. For tests and dry runs only.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuoteVerifier {
    answer: bool,
}

impl FixedQuoteVerifier {
    /// Verifier that accepts every quote.
    #[must_use]
    pub const fn accepting() -> Self {
        Self { answer: true }
    }

    /// Verifier that rejects every quote.
    #[must_use]
    pub const fn rejecting() -> Self {
        Self { answer: false }
    }
}

impl QuoteVerifier for FixedQuoteVerifier {
    fn verify_quote(
        &self,
        _quote: &[u8],
        _signature: &[u8],
    ) -> std::result::Result<bool, QuoteUnavailable> {
        Ok(self.answer)
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}
