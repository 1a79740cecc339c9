//! Attestation records: the parsed form of evidence describing a TEE instance.
//!
//! A record is parsed once from its JSON wire form and is immutable afterwards.
//! Parsing only enforces presence and decodability; the hex format of measurement
//! values and every semantic rule are checked by the validator so that the
//! resulting report names each failure.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AttestationError, Result};
use crate::network::Network;

/// Regex for flat measurement keys (`pcr0`, `PCR12`, ...).
static FLAT_PCR_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)pcr[0-9]+$").unwrap_or_else(|_| unreachable!()));

/// Named platform configuration registers mapped to hex digests, ordered by name.
pub type Measurements = BTreeMap<String, String>;

/// Wire representation, used for both input and output.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wallet_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_data_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    measurements: Option<BTreeMap<String, String>>,
    #[serde(default)]
    attestation_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_quote: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Parsed attestation evidence for one deployment instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationRecord {
    job_id: String,
    ip_address: String,
    wallet_address: String,
    measurements: Measurements,
    user_data_digest: Option<String>,
    timestamp: DateTime<Utc>,
    network: Network,
    signature: Option<Vec<u8>>,
    raw_quote: Option<Vec<u8>>,
    claimed_verified: bool,
}

impl AttestationRecord {
    /// Start building a record programmatically.
    #[must_use]
    pub fn builder() -> AttestationRecordBuilder {
        AttestationRecordBuilder::default()
    }

    /// Parse a record from its JSON wire form.
    ///
    /// Accepts either a nested `measurements` object or flat `pcrN` keys (both
    /// are merged, nested entries win). Measurement names are lower-cased.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::MalformedRecord` if the JSON is invalid, a required
    /// field (`job_id`, `timestamp`, `network`, measurements) is absent, the timestamp
    /// does not parse, or `signature`/`raw_quote` are not valid hex/base64.
    pub fn from_json(input: &str) -> Result<Self> {
        let wire: WireRecord = serde_json::from_str(input)
            .map_err(|e| AttestationError::MalformedRecord(format!("invalid JSON: {e}")))?;
        Self::from_wire(wire)
    }

    /// Parse a record from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Io` if the file cannot be read, or
    /// `AttestationError::MalformedRecord` if its content does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AttestationError::Io(format!("failed to read record '{}': {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    fn from_wire(wire: WireRecord) -> Result<Self> {
        let job_id = required(wire.job_id, "job_id")?;
        let network = Network::parse(&required(wire.network, "network")?);
        let timestamp = parse_timestamp(&required(wire.timestamp, "timestamp")?)?;

        let mut measurements = Measurements::new();
        for (key, value) in &wire.extra {
            if !FLAT_PCR_KEY_REGEX.is_match(key) {
                continue;
            }
            let value = value.as_str().ok_or_else(|| {
                AttestationError::MalformedRecord(format!("measurement '{key}' is not a string"))
            })?;
            measurements.insert(key.to_ascii_lowercase(), value.to_string());
        }
        let had_flat = !measurements.is_empty();
        let had_nested = wire.measurements.is_some();
        for (key, value) in wire.measurements.unwrap_or_default() {
            measurements.insert(key.to_ascii_lowercase(), value);
        }
        if !had_flat && !had_nested {
            return Err(AttestationError::MalformedRecord(
                "missing required field: measurements".to_string(),
            ));
        }

        let signature = wire
            .signature
            .filter(|s| !s.is_empty())
            .map(|s| {
                hex::decode(s.trim_start_matches("0x")).map_err(|e| {
                    AttestationError::MalformedRecord(format!("signature is not hex: {e}"))
                })
            })
            .transpose()?;
        let raw_quote = wire
            .raw_quote
            .filter(|s| !s.is_empty())
            .map(|s| {
                BASE64.decode(s.as_bytes()).map_err(|e| {
                    AttestationError::MalformedRecord(format!("raw_quote is not base64: {e}"))
                })
            })
            .transpose()?;

        Ok(Self {
            job_id,
            ip_address: wire.ip_address.unwrap_or_default(),
            wallet_address: wire.wallet_address.unwrap_or_default(),
            measurements,
            user_data_digest: wire.user_data_digest.filter(|d| !d.is_empty()),
            timestamp,
            network,
            signature,
            raw_quote,
            claimed_verified: wire.attestation_verified,
        })
    }

    /// Serialize to the JSON wire form.
    ///
    /// `attestation_verified` is always written as `false`: an unvalidated record
    /// never claims trust.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::MalformedRecord` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        self.to_json_with_flag(false)
    }

    pub(crate) fn to_json_with_flag(&self, verified: bool) -> Result<String> {
        let wire = WireRecord {
            job_id: Some(self.job_id.clone()),
            ip_address: Some(self.ip_address.clone()),
            wallet_address: Some(self.wallet_address.clone()),
            user_data_digest: self.user_data_digest.clone(),
            timestamp: Some(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            network: Some(self.network.as_str().to_string()),
            measurements: Some(self.measurements.clone()),
            attestation_verified: verified,
            signature: self.signature.as_ref().map(hex::encode),
            raw_quote: self.raw_quote.as_ref().map(|q| BASE64.encode(q)),
            extra: BTreeMap::new(),
        };
        serde_json::to_string_pretty(&wire)
            .map_err(|e| AttestationError::MalformedRecord(format!("serialization failed: {e}")))
    }

    /// Identifier binding the record to a deployment instance.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Network address of the attested service.
    #[must_use]
    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    /// Operator wallet associated with the deployment. Advisory only.
    #[must_use]
    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    /// Platform measurements, ordered by register name.
    #[must_use]
    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    /// Digest binding the record to a deployment descriptor, if present.
    #[must_use]
    pub fn user_data_digest(&self) -> Option<&str> {
        self.user_data_digest.as_deref()
    }

    /// When the evidence was produced.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Target deployment network.
    #[must_use]
    pub const fn network(&self) -> &Network {
        &self.network
    }

    /// Signature over the quote payload, if present.
    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Opaque vendor quote, if present.
    #[must_use]
    pub fn raw_quote(&self) -> Option<&[u8]> {
        self.raw_quote.as_deref()
    }

    /// The `attestation_verified` flag as claimed by the source. Never trusted.
    #[must_use]
    pub const fn claimed_verified(&self) -> bool {
        self.claimed_verified
    }

    /// Bytes the trust-root signature covers.
    ///
    /// Always the canonical encoding of the bound fields (job id, user-data digest,
    /// sorted measurements, timestamp, network), followed by the raw vendor quote
    /// when one is present. A quote is therefore only valid for the record it was
    /// issued with.
    #[must_use]
    pub fn quote_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"teegate_attestation_v1\n");
        push_field(&mut out, "job_id", &self.job_id);
        push_field(
            &mut out,
            "user_data_digest",
            &self.user_data_digest.as_deref().unwrap_or_default().to_ascii_lowercase(),
        );
        for (name, value) in &self.measurements {
            push_field(&mut out, name, &value.to_ascii_lowercase());
        }
        push_field(&mut out, "timestamp", &self.timestamp.timestamp().to_string());
        push_field(&mut out, "network", self.network.as_str());
        if let Some(quote) = &self.raw_quote {
            push_field(&mut out, "raw_quote", &hex::encode(quote));
        }
        out
    }
}

fn push_field(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AttestationError::MalformedRecord(format!(
            "missing required field: {field}"
        ))),
    }
}

/// Parse an ISO-8601 timestamp. Offsets are normalized to UTC; a timestamp without
/// an offset is taken to be UTC already.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| AttestationError::MalformedRecord(format!("invalid timestamp '{raw}': {e}")))
}

/// Builder for [`AttestationRecord`], mainly for embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct AttestationRecordBuilder {
    job_id: String,
    ip_address: String,
    wallet_address: String,
    measurements: Measurements,
    user_data_digest: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    network: Option<Network>,
    signature: Option<Vec<u8>>,
    raw_quote: Option<Vec<u8>>,
    claimed_verified: bool,
}

impl AttestationRecordBuilder {
    /// Set the job identifier.
    #[must_use]
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Set the service address.
    #[must_use]
    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = ip.into();
        self
    }

    /// Set the operator wallet.
    #[must_use]
    pub fn wallet_address(mut self, wallet: impl Into<String>) -> Self {
        self.wallet_address = wallet.into();
        self
    }

    /// Add one measurement. The name is lower-cased.
    #[must_use]
    pub fn measurement(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.measurements
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Replace all measurements.
    #[must_use]
    pub fn measurements(mut self, measurements: Measurements) -> Self {
        self.measurements = measurements;
        self
    }

    /// Set the user-data digest.
    #[must_use]
    pub fn user_data_digest(mut self, digest: impl Into<String>) -> Self {
        self.user_data_digest = Some(digest.into());
        self
    }

    /// Set the evidence timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the target network.
    #[must_use]
    pub fn network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the signature bytes.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Set the raw vendor quote.
    #[must_use]
    pub fn raw_quote(mut self, quote: impl Into<Vec<u8>>) -> Self {
        self.raw_quote = Some(quote.into());
        self
    }

    /// Set the source-claimed verified flag.
    #[must_use]
    pub const fn claimed_verified(mut self, claimed: bool) -> Self {
        self.claimed_verified = claimed;
        self
    }

    /// Build the record.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::MalformedRecord` if the job id, timestamp or
    /// network is missing.
    pub fn build(self) -> Result<AttestationRecord> {
        if self.job_id.trim().is_empty() {
            return Err(AttestationError::MalformedRecord(
                "missing required field: job_id".to_string(),
            ));
        }
        let timestamp = self.timestamp.ok_or_else(|| {
            AttestationError::MalformedRecord("missing required field: timestamp".to_string())
        })?;
        let network = self.network.ok_or_else(|| {
            AttestationError::MalformedRecord("missing required field: network".to_string())
        })?;
        Ok(AttestationRecord {
            job_id: self.job_id,
            ip_address: self.ip_address,
            wallet_address: self.wallet_address,
            measurements: self.measurements,
            user_data_digest: self.user_data_digest,
            timestamp,
            network,
            signature: self.signature,
            raw_quote: self.raw_quote,
            claimed_verified: self.claimed_verified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PCR0: &str = "0d8c50f0d0e9ecf25c48ba9ed1d8d5dc475be1dba553a0ef299f385bd7447220";
    const PCR1: &str = "d71f06f25bcd891848eecfcd65688831d9acf4be17da631b15fb5b1ecd7c3d23";
    const PCR2: &str = "bd79abe09f36d95bb28c08d6f9d758c3bddebc6aa634b8c65cbae4b4b54a4146";

    fn nested_json() -> String {
        format!(
            r#"{{
                "job_id": "0x00000000000000000000000000000000000000000000000000000000000007b1",
                "ip_address": "13.201.207.60",
                "wallet_address": "0x5b3a6b1e6f0c4d0b5f3d7c6b9d4a3e2f1a0b9c8d",
                "user_data_digest": "aa11",
                "timestamp": "2025-03-01T12:00:00Z",
                "network": "arbitrum",
                "measurements": {{ "PCR0": "{PCR0}", "pcr1": "{PCR1}", "pcr2": "{PCR2}" }},
                "attestation_verified": true,
                "signature": "0xdeadbeef"
            }}"#
        )
    }

    #[test]
    fn parses_nested_measurements() {
        let record = AttestationRecord::from_json(&nested_json()).expect("parse");
        assert_eq!(record.measurements().len(), 3);
        assert_eq!(record.measurements().get("pcr0").map(String::as_str), Some(PCR0));
        assert_eq!(record.network(), &Network::ArbitrumMainnet);
        assert_eq!(record.ip_address(), "13.201.207.60");
        assert_eq!(record.signature(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
        assert!(record.claimed_verified());
        assert_eq!(record.timestamp().to_rfc3339(), "2025-03-01T12:00:00+00:00");
    }

    #[test]
    fn parses_flat_pcr_keys() {
        let json = format!(
            r#"{{"job_id":"job-1","timestamp":"2025-03-01T12:00:00","network":"base",
                "pcr0":"{PCR0}","pcr1":"{PCR1}","pcr2":"{PCR2}","ignored":"x"}}"#
        );
        let record = AttestationRecord::from_json(&json).expect("parse");
        let names: Vec<_> = record.measurements().keys().cloned().collect();
        assert_eq!(names, vec!["pcr0", "pcr1", "pcr2"]);
        assert_eq!(record.user_data_digest(), None);
        assert!(!record.claimed_verified());
    }

    #[test]
    fn naive_and_offset_timestamps_normalize_to_utc() {
        let naive = parse_timestamp("2025-03-01T12:00:00.123456").expect("naive");
        let offset = parse_timestamp("2025-03-01T14:00:00.123456+02:00").expect("offset");
        assert_eq!(naive, offset);
    }

    #[test]
    fn missing_fields_fail_loudly() {
        for field in ["job_id", "timestamp", "network"] {
            let mut value: Value = serde_json::from_str(&nested_json()).expect("json");
            value.as_object_mut().expect("object").remove(field);
            let err = AttestationRecord::from_json(&value.to_string()).expect_err("must fail");
            assert_eq!(
                err,
                AttestationError::MalformedRecord(format!("missing required field: {field}"))
            );
        }
    }

    #[test]
    fn missing_measurements_fail() {
        let json = r#"{"job_id":"j","timestamp":"2025-03-01T12:00:00Z","network":"base"}"#;
        assert!(matches!(
            AttestationRecord::from_json(json),
            Err(AttestationError::MalformedRecord(msg)) if msg.contains("measurements")
        ));
    }

    #[test]
    fn bad_timestamp_and_encodings_fail() {
        let bad_ts = nested_json().replace("2025-03-01T12:00:00Z", "yesterday");
        assert!(matches!(
            AttestationRecord::from_json(&bad_ts),
            Err(AttestationError::MalformedRecord(_))
        ));
        let bad_sig = nested_json().replace("0xdeadbeef", "zz");
        assert!(matches!(
            AttestationRecord::from_json(&bad_sig),
            Err(AttestationError::MalformedRecord(_))
        ));
        let flat_number = r#"{"job_id":"j","timestamp":"2025-03-01T12:00:00Z","network":"base","pcr0":7}"#;
        assert!(matches!(
            AttestationRecord::from_json(flat_number),
            Err(AttestationError::MalformedRecord(_))
        ));
    }

    #[test]
    fn to_json_never_claims_verified() {
        let record = AttestationRecord::from_json(&nested_json()).expect("parse");
        let json = record.to_json().expect("serialize");
        let reparsed = AttestationRecord::from_json(&json).expect("reparse");
        assert!(!reparsed.claimed_verified());
        assert_eq!(reparsed.measurements(), record.measurements());
        assert_eq!(reparsed.signature(), record.signature());
    }

    #[test]
    fn quote_payload_binds_fields_and_raw_quote() {
        let base = AttestationRecord::builder()
            .job_id("job")
            .timestamp(Utc::now())
            .network(Network::BaseMainnet)
            .measurement("pcr0", PCR0);
        let canonical = base.clone().build().expect("build").quote_payload();
        assert!(canonical.starts_with(b"teegate_attestation_v1\n"));

        let with_quote = base.clone().raw_quote(vec![1, 2, 3]).build().expect("build");
        let payload = with_quote.quote_payload();
        assert!(payload.starts_with(&canonical));
        assert!(payload.ends_with(b"raw_quote=010203\n"));

        // Same quote, different job: different payload.
        let moved = base.job_id("other-job").raw_quote(vec![1, 2, 3]).build().expect("build");
        assert_ne!(moved.quote_payload(), payload);
    }

    #[test]
    fn canonical_payload_ignores_hex_case() {
        let ts = Utc::now();
        let lower = AttestationRecord::builder()
            .job_id("job")
            .timestamp(ts)
            .network(Network::BaseMainnet)
            .measurement("pcr0", PCR0)
            .build()
            .expect("build");
        let upper = AttestationRecord::builder()
            .job_id("job")
            .timestamp(ts)
            .network(Network::BaseMainnet)
            .measurement("PCR0", PCR0.to_ascii_uppercase())
            .build()
            .expect("build");
        assert_eq!(lower.quote_payload(), upper.quote_payload());
    }

    #[test]
    fn builder_requires_identity_fields() {
        assert!(AttestationRecord::builder().build().is_err());
        assert!(
            AttestationRecord::builder()
                .job_id("j")
                .timestamp(Utc::now())
                .build()
                .is_err()
        );
    }
}
