//! Where attestation records come from.
//!
//! A source only fetches and parses. Every trust decision belongs to the
//! validator, so a record arriving with `attestation_verified: true` is treated
//! exactly like one without it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use teegate_attestation::{AttestationError, AttestationRecord};
use tracing::{debug, warn};

use crate::config::SourceConfig;

type SourceResult<T> = std::result::Result<T, AttestationError>;

/// Largest attestation document accepted over HTTP.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Supplies the record to verify.
///
/// Transport failures must be reported as `AttestationError::SourceUnavailable`;
/// undecodable payloads as `AttestationError::MalformedRecord`.
pub trait AttestationSource: Send + Sync {
    /// Fetch and parse the current record.
    fn fetch(&self) -> impl Future<Output = SourceResult<AttestationRecord>> + Send;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl<T: AttestationSource> AttestationSource for Arc<T> {
    fn fetch(&self) -> impl Future<Output = SourceResult<AttestationRecord>> + Send {
        (**self).fetch()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Fetches records from an attestation service over HTTP.
///
/// The record is served at `GET {endpoint}/attestation`.
#[derive(Debug, Clone)]
pub struct HttpAttestationSource {
    client: reqwest::Client,
    endpoint: String,
    app_url: Option<String>,
    max_body_bytes: usize,
}

impl HttpAttestationSource {
    /// Create a source for `endpoint` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` if the endpoint is not http(s) or the
    /// client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> SourceResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(AttestationError::Config(format!(
                "attestation endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AttestationError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            app_url: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Reject response bodies larger than `limit` bytes.
    #[must_use]
    pub const fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Set the application URL probed by [`Self::probe_liveness`].
    #[must_use]
    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = Some(app_url.into());
        self
    }

    /// Full URL of the attestation document.
    #[must_use]
    pub fn attestation_url(&self) -> String {
        format!("{}/attestation", self.endpoint)
    }

    /// Check that the application answers `GET /` with 200.
    ///
    /// Probes the configured app URL, or the attestation endpoint when none is set.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::SourceUnavailable` if the request cannot be made.
    pub async fn probe_liveness(&self) -> SourceResult<bool> {
        let base = self.app_url.as_deref().unwrap_or(&self.endpoint);
        probe_with(&self.client, base).await
    }
}

/// Probe `GET {url}/` once and report whether it answered 200.
///
/// # Errors
///
/// Returns `AttestationError::Config` if the client cannot be built, or
/// `AttestationError::SourceUnavailable` if the request cannot be made.
pub async fn probe_liveness(url: &str, timeout: Duration) -> SourceResult<bool> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AttestationError::Config(format!("failed to build HTTP client: {e}")))?;
    probe_with(&client, url).await
}

async fn probe_with(client: &reqwest::Client, base: &str) -> SourceResult<bool> {
    let url = format!("{}/", base.trim_end_matches('/'));
    let response = client.get(&url).send().await.map_err(|e| {
        AttestationError::SourceUnavailable(format!("liveness probe to {url} failed: {e}"))
    })?;
    let status = response.status();
    debug!(%url, %status, "liveness probe");
    Ok(status == StatusCode::OK)
}

impl HttpAttestationSource {
    async fn read_body(&self, url: &str, mut response: reqwest::Response) -> SourceResult<String> {
        let limit = self.max_body_bytes;
        let oversized = || {
            AttestationError::MalformedRecord(format!(
                "response from {url} exceeds {limit} bytes"
            ))
        };
        let limit_u64 = u64::try_from(limit).unwrap_or(u64::MAX);
        if response.content_length().is_some_and(|len| len > limit_u64) {
            return Err(oversized());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            AttestationError::SourceUnavailable(format!("failed to read body from {url}: {e}"))
        })? {
            if body.len() + chunk.len() > limit {
                return Err(oversized());
            }
            body.extend_from_slice(&chunk);
        }
        String::from_utf8(body).map_err(|e| {
            AttestationError::MalformedRecord(format!("response from {url} is not UTF-8: {e}"))
        })
    }
}

impl AttestationSource for HttpAttestationSource {
    async fn fetch(&self) -> SourceResult<AttestationRecord> {
        let url = self.attestation_url();
        let response = self.client.get(&url).send().await.map_err(|e| {
            AttestationError::SourceUnavailable(format!("request to {url} failed: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttestationError::SourceUnavailable(format!(
                "{url} returned HTTP {status}"
            )));
        }
        let body = self.read_body(&url, response).await?;
        debug!(%url, bytes = body.len(), "fetched attestation record");
        AttestationRecord::from_json(&body)
    }

    fn describe(&self) -> String {
        self.attestation_url()
    }
}

/// Reads a persisted record from disk.
#[derive(Debug, Clone)]
pub struct FileAttestationSource {
    path: PathBuf,
}

impl FileAttestationSource {
    /// Create a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttestationSource for FileAttestationSource {
    async fn fetch(&self) -> SourceResult<AttestationRecord> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AttestationError::SourceUnavailable(format!(
                "failed to read persisted record '{}': {e}",
                self.path.display()
            ))
        })?;
        AttestationRecord::from_json(&content)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Tries `primary`, and only when it is unreachable, `fallback`.
///
/// A malformed record from the primary is returned as-is: falling back on bad
/// evidence would let an attacker choose which record gets validated.
#[derive(Debug, Clone)]
pub struct FallbackSource<P, F> {
    primary: P,
    fallback: F,
}

impl<P: AttestationSource, F: AttestationSource> FallbackSource<P, F> {
    /// Combine two sources.
    #[must_use]
    pub const fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: AttestationSource, F: AttestationSource> AttestationSource for FallbackSource<P, F> {
    async fn fetch(&self) -> SourceResult<AttestationRecord> {
        match self.primary.fetch().await {
            Err(primary_err) if primary_err.is_retryable() => {
                warn!(
                    primary = %self.primary.describe(),
                    fallback = %self.fallback.describe(),
                    error = %primary_err,
                    "primary attestation source unavailable, using fallback"
                );
                self.fallback.fetch().await.map_err(|fallback_err| match fallback_err {
                    AttestationError::SourceUnavailable(detail) => {
                        AttestationError::SourceUnavailable(format!("{primary_err}; {detail}"))
                    }
                    other => other,
                })
            }
            other => other,
        }
    }

    fn describe(&self) -> String {
        format!("{} (fallback {})", self.primary.describe(), self.fallback.describe())
    }
}

/// The source selected by a [`SourceConfig`].
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    /// HTTP endpoint only.
    Http(HttpAttestationSource),
    /// Persisted record only.
    File(FileAttestationSource),
    /// HTTP endpoint, falling back to the persisted record.
    HttpWithFileFallback(FallbackSource<HttpAttestationSource, FileAttestationSource>),
}

impl ConfiguredSource {
    /// Build the source described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` if neither an endpoint nor a persisted
    /// record is configured, or the HTTP client cannot be built.
    pub fn from_config(config: &SourceConfig) -> SourceResult<Self> {
        let http = config
            .endpoint
            .as_deref()
            .map(|endpoint| {
                let source = HttpAttestationSource::new(
                    endpoint,
                    Duration::from_secs(config.request_timeout_secs),
                )?;
                Ok::<_, AttestationError>(match &config.app_url {
                    Some(app_url) => source.with_app_url(app_url),
                    None => source,
                })
            })
            .transpose()?;
        let file = config.persisted_record.as_ref().map(FileAttestationSource::new);

        match (http, file) {
            (Some(http), Some(file)) => Ok(Self::HttpWithFileFallback(FallbackSource::new(http, file))),
            (Some(http), None) => Ok(Self::Http(http)),
            (None, Some(file)) => Ok(Self::File(file)),
            (None, None) => Err(AttestationError::Config(
                "no attestation source configured: set source.endpoint or source.persisted_record"
                    .to_string(),
            )),
        }
    }

    /// The HTTP source, if one is configured.
    #[must_use]
    pub const fn http(&self) -> Option<&HttpAttestationSource> {
        match self {
            Self::Http(http) => Some(http),
            Self::HttpWithFileFallback(fallback) => Some(&fallback.primary),
            Self::File(_) => None,
        }
    }
}

impl AttestationSource for ConfiguredSource {
    async fn fetch(&self) -> SourceResult<AttestationRecord> {
        match self {
            Self::Http(source) => source.fetch().await,
            Self::File(source) => source.fetch().await,
            Self::HttpWithFileFallback(source) => source.fetch().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Http(source) => source.describe(),
            Self::File(source) => source.describe(),
            Self::HttpWithFileFallback(source) => source.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const RECORD: &str = r#"{
        "job_id": "job-42",
        "timestamp": "2025-03-01T12:00:00Z",
        "network": "arbitrum-mainnet",
        "attestation_verified": true,
        "measurements": {
            "pcr0": "0d8c50f0d0e9ecf25c48ba9ed1d8d5dc475be1dba553a0ef299f385bd7447220"
        }
    }"#;

    /// Serve a fixed response to every connection on a loopback port.
    async fn serve(status: &'static str, body: impl Into<String>) -> String {
        let body = body.into();
        serve_raw(format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ))
        .await
    }

    /// Writes `response` verbatim to every connection.
    async fn serve_raw(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    async fn unused_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        format!("http://{addr}")
    }

    struct CountingSource {
        result: SourceResult<AttestationRecord>,
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new(result: SourceResult<AttestationRecord>) -> Self {
            Self {
                result,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AttestationSource for CountingSource {
        async fn fetch(&self) -> SourceResult<AttestationRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    fn record() -> AttestationRecord {
        AttestationRecord::from_json(RECORD).expect("record")
    }

    #[tokio::test]
    async fn http_source_fetches_and_parses() {
        let url = serve("200 OK", RECORD).await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(5)).expect("source");
        assert_eq!(source.attestation_url(), format!("{url}/attestation"));

        let fetched = source.fetch().await.expect("fetch");
        assert_eq!(fetched.job_id(), "job-42");
        assert!(fetched.claimed_verified());
    }

    #[tokio::test]
    async fn http_error_status_is_source_unavailable() {
        let url = serve("503 Service Unavailable", "{}").await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(5)).expect("source");
        let err = source.fetch().await.expect_err("should fail");
        assert!(matches!(err, AttestationError::SourceUnavailable(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn http_garbage_body_is_malformed() {
        let url = serve("200 OK", "not json").await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(5)).expect("source");
        let err = source.fetch().await.expect_err("should fail");
        assert!(matches!(err, AttestationError::MalformedRecord(_)));
    }

    #[tokio::test]
    async fn http_oversized_body_is_malformed() {
        let url = serve("200 OK", "x".repeat(200)).await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(5))
            .expect("source")
            .with_max_body_bytes(64);
        let err = source.fetch().await.expect_err("should fail");
        assert!(matches!(err, AttestationError::MalformedRecord(msg) if msg.contains("64 bytes")));

        // Same limit when the server sends no Content-Length and streams until close.
        let url = serve_raw(format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{}",
            "y".repeat(200)
        ))
        .await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(5))
            .expect("source")
            .with_max_body_bytes(64);
        let err = source.fetch().await.expect_err("should fail");
        assert!(matches!(err, AttestationError::MalformedRecord(msg) if msg.contains("64 bytes")));

        // The default limit still admits a normal record.
        let url = serve("200 OK", RECORD).await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(5)).expect("source");
        assert!(source.fetch().await.is_ok());
    }

    #[tokio::test]
    async fn http_connection_refused_is_source_unavailable() {
        let url = unused_port_url().await;
        let source = HttpAttestationSource::new(&url, Duration::from_secs(2)).expect("source");
        let err = source.fetch().await.expect_err("should fail");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn liveness_probe_checks_for_200() {
        let up = serve("200 OK", "").await;
        let source = HttpAttestationSource::new(&up, Duration::from_secs(5)).expect("source");
        assert!(source.probe_liveness().await.expect("probe"));

        let down = serve("500 Internal Server Error", "").await;
        let source = HttpAttestationSource::new(&up, Duration::from_secs(5))
            .expect("source")
            .with_app_url(down);
        assert!(!source.probe_liveness().await.expect("probe"));

        let refused = unused_port_url().await;
        let source = HttpAttestationSource::new(&refused, Duration::from_secs(2)).expect("source");
        assert!(source.probe_liveness().await.is_err());
    }

    #[tokio::test]
    async fn standalone_probe() {
        let up = serve("200 OK", "").await;
        assert!(probe_liveness(&up, Duration::from_secs(5)).await.expect("probe"));
        let no_content = serve("204 No Content", "").await;
        assert!(!probe_liveness(&no_content, Duration::from_secs(5)).await.expect("probe"));
    }

    #[test]
    fn http_source_rejects_non_http_endpoint() {
        let err = HttpAttestationSource::new("ftp://example.com", Duration::from_secs(1))
            .expect_err("should fail");
        assert!(matches!(err, AttestationError::Config(_)));
    }

    #[tokio::test]
    async fn file_source_reads_record() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(RECORD.as_bytes()).expect("write");
        let source = FileAttestationSource::new(file.path());
        assert_eq!(source.fetch().await.expect("fetch").job_id(), "job-42");
        assert!(source.describe().starts_with("file://"));
    }

    #[tokio::test]
    async fn missing_file_is_source_unavailable() {
        let source = FileAttestationSource::new("/nonexistent/attestation.json");
        let err = source.fetch().await.expect_err("should fail");
        assert!(matches!(err, AttestationError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn fallback_used_only_when_primary_unavailable() {
        let primary = CountingSource::new(Err(AttestationError::SourceUnavailable("down".into())));
        let fallback = CountingSource::new(Ok(record()));
        let source = FallbackSource::new(primary, fallback);
        assert_eq!(source.fetch().await.expect("fetch").job_id(), "job-42");
        assert_eq!(source.fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_not_used_for_malformed_primary() {
        let primary = CountingSource::new(Err(AttestationError::MalformedRecord("bad".into())));
        let fallback = CountingSource::new(Ok(record()));
        let source = FallbackSource::new(primary, fallback);
        let err = source.fetch().await.expect_err("should fail");
        assert!(matches!(err, AttestationError::MalformedRecord(_)));
        assert_eq!(source.fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_failure_reports_both_sources() {
        let primary = CountingSource::new(Err(AttestationError::SourceUnavailable("http down".into())));
        let fallback = CountingSource::new(Err(AttestationError::SourceUnavailable("no file".into())));
        let err = FallbackSource::new(primary, fallback)
            .fetch()
            .await
            .expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("http down") && msg.contains("no file"), "{msg}");
    }

    #[test]
    fn configured_source_selection() {
        let mut config = SourceConfig::default();
        assert!(ConfiguredSource::from_config(&config).is_err());

        config.persisted_record = Some(PathBuf::from("/var/lib/teegate/attestation.json"));
        let source = ConfiguredSource::from_config(&config).expect("file");
        assert!(matches!(source, ConfiguredSource::File(_)));
        assert!(source.http().is_none());

        config.endpoint = Some("http://127.0.0.1:8080".to_string());
        let source = ConfiguredSource::from_config(&config).expect("fallback");
        assert!(matches!(source, ConfiguredSource::HttpWithFileFallback(_)));
        assert!(source.http().is_some());

        config.persisted_record = None;
        let source = ConfiguredSource::from_config(&config).expect("http");
        assert!(matches!(source, ConfiguredSource::Http(_)));
    }
}
