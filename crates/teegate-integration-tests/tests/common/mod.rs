//! Shared fixtures: reference measurements, signed records and a throw-away HTTP server.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use teegate_attestation::{
    AttestationRecord, AttestationValidator, Ed25519QuoteVerifier, InMemoryReferenceStore,
    Network, PresetId, ValidatorConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const PCR0: &str = "0d8c50f0d0e9ecf25c48ba9ed1d8d5dc475be1dba553a0ef299f385bd7447220";
pub const PCR1: &str = "d71f06f25bcd891848eecfcd65688831d9acf4be17da631b15fb5b1ecd7c3d23";
pub const PCR2: &str = "bd79abe09f36d95bb28c08d6f9d758c3bddebc6aa634b8c65cbae4b4b54a4146";

pub fn preset() -> PresetId {
    PresetId::new("arm64", "v1.0.0")
}

/// The reference file shipped in `config/`.
pub fn reference_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../config/reference-measurements.toml")
}

pub fn reference_store() -> InMemoryReferenceStore {
    InMemoryReferenceStore::from_file(reference_file()).expect("shipped reference file")
}

/// Issues records signed by a fresh trust-root key, standing in for the enclave vendor.
pub struct TrustRoot {
    signing_key: SigningKey,
}

impl TrustRoot {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn validator(&self) -> AttestationValidator {
        AttestationValidator::new(
            ValidatorConfig::default(),
            Arc::new(Ed25519QuoteVerifier::new(self.signing_key.verifying_key())),
        )
        .expect("validator")
    }

    /// A signed record for the reference preset.
    pub fn record(&self, spec: &RecordSpec) -> AttestationRecord {
        let unsigned = spec.builder().build().expect("unsigned record");
        let signature = self.signing_key.sign(&unsigned.quote_payload()).to_bytes();
        spec.builder().signature(signature.to_vec()).build().expect("signed record")
    }

    /// The JSON wire form of a signed record.
    pub fn record_json(&self, spec: &RecordSpec) -> String {
        self.record(spec).to_json().expect("serialize")
    }
}

/// Knobs for generating a record.
#[derive(Clone)]
pub struct RecordSpec {
    pub job_id: String,
    pub pcr0: String,
    pub network: Network,
    pub timestamp: DateTime<Utc>,
    pub user_data_digest: Option<String>,
}

impl RecordSpec {
    /// The §8 reference scenario: matching PCRs, arbitrum, one hour old.
    pub fn reference() -> Self {
        Self {
            job_id: "job-7f3a".to_string(),
            pcr0: PCR0.to_string(),
            network: Network::parse("arbitrum"),
            timestamp: Utc::now() - chrono::Duration::hours(1),
            user_data_digest: None,
        }
    }

    fn builder(&self) -> teegate_attestation::AttestationRecordBuilder {
        let mut builder = AttestationRecord::builder()
            .job_id(self.job_id.clone())
            .ip_address("10.0.4.17")
            .wallet_address("0x5aeda56215b167893e80b4fe645ba6d5bab767de")
            .measurement("pcr0", self.pcr0.clone())
            .measurement("pcr1", PCR1)
            .measurement("pcr2", PCR2)
            .timestamp(self.timestamp)
            .network(self.network.clone());
        if let Some(digest) = &self.user_data_digest {
            builder = builder.user_data_digest(digest.clone());
        }
        builder
    }
}

/// Minimal HTTP/1.1 server: `GET /attestation` returns the current body, `GET /` returns 200.
pub struct TestServer {
    addr: SocketAddr,
    body: Arc<Mutex<String>>,
    status: Arc<Mutex<u16>>,
    attestation_requests: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start(body: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let body = Arc::new(Mutex::new(body));
        let status = Arc::new(Mutex::new(200u16));
        let attestation_requests = Arc::new(AtomicUsize::new(0));

        tokio::spawn({
            let body = Arc::clone(&body);
            let status = Arc::clone(&status);
            let attestation_requests = Arc::clone(&attestation_requests);
            async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let mut buf = vec![0u8; 8192];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let (code, payload) = if path == "/attestation" {
                        attestation_requests.fetch_add(1, Ordering::SeqCst);
                        (*status.lock(), body.lock().clone())
                    } else if path == "/" {
                        (200, "ok".to_string())
                    } else {
                        (404, String::new())
                    };
                    let reason = match code {
                        200 => "OK",
                        404 => "Not Found",
                        _ => "Error",
                    };
                    let response = format!(
                        "HTTP/1.1 {code} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                        payload.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            }
        });

        Self {
            addr,
            body,
            status,
            attestation_requests,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_body(&self, body: String) {
        *self.body.lock() = body;
    }

    pub fn set_status(&self, status: u16) {
        *self.status.lock() = status;
    }

    pub fn attestation_requests(&self) -> usize {
        self.attestation_requests.load(Ordering::SeqCst)
    }
}
