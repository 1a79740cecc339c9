//! Subcommand implementations.
//!
//! Each command writes its user-facing output to the given writer; logs go to
//! stderr through `tracing`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use teegate_attestation::{CheckOutcome, DigestComputer, ValidationReport};
use teegate_gate::{GateConfig, GateError, SAMPLE_CONFIG, probe_liveness, spawn_reverifier};
use tracing::{info, warn};

use crate::cli::Format;

/// `teegate digest`.
pub fn digest<W: Write>(out: &mut W, file: &Path) -> anyhow::Result<()> {
    let digest = DigestComputer::new().digest_file(file)?;
    writeln!(out, "{digest}  {}", file.display())?;
    Ok(())
}

/// `teegate init-config`.
pub fn init_config<W: Write>(out: &mut W, output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", output.display());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(output, SAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", output.display()))?;
    writeln!(out, "wrote sample configuration to {}", output.display())?;
    Ok(())
}

/// Load the config, pointing the source at `record` when given.
pub fn load_config(path: &Path, record: Option<PathBuf>) -> anyhow::Result<GateConfig> {
    let mut config = GateConfig::from_file(path)?;
    if let Some(record) = record {
        config.source.endpoint = None;
        config.source.persisted_record = Some(record);
    }
    Ok(config)
}

/// `teegate verify`.
pub async fn verify<W: Write>(
    out: &mut W,
    config: &GateConfig,
    format: Format,
) -> anyhow::Result<()> {
    let gate = config.build_gate()?;
    let result = gate.verify().await;

    if let Some(report) = gate.last_report() {
        write_report(out, &report, format)?;
    }

    match result {
        Ok(verified) => {
            info!(job_id = %verified.record().job_id(), "attestation verified");
            Ok(())
        }
        Err(GateError::Rejected { report }) => bail!("attestation rejected: {}", report.summary()),
        Err(e) => Err(e.into()),
    }
}

/// Print a validation report.
pub fn write_report<W: Write>(
    out: &mut W,
    report: &ValidationReport,
    format: Format,
) -> anyhow::Result<()> {
    match format {
        Format::Json => {
            writeln!(out, "{}", report.to_json()?)?;
        }
        Format::Text => {
            writeln!(
                out,
                "job:    {}",
                report.job_id.as_deref().unwrap_or("<unparsed>")
            )?;
            if let Some(preset) = &report.preset {
                writeln!(out, "preset: {preset}")?;
            }
            writeln!(out, "at:     {}", report.validated_at.to_rfc3339())?;
            writeln!(out)?;
            writeln!(out, "{:<22} {:<15} DETAIL", "CHECK", "OUTCOME")?;
            for check in &report.checks {
                writeln!(
                    out,
                    "{:<22} {:<15} {}",
                    check.check.as_str(),
                    check.outcome.to_string(),
                    check.detail
                )?;
            }
            writeln!(out)?;
            let verdict = if report.overall { "VERIFIED" } else { "REJECTED" };
            let failed = report
                .checks
                .iter()
                .filter(|c| c.outcome == CheckOutcome::Fail)
                .count();
            writeln!(out, "overall: {verdict} ({failed} failed)")?;
        }
    }
    Ok(())
}

/// `teegate probe`.
pub async fn probe<W: Write>(out: &mut W, url: &str, timeout: Duration) -> anyhow::Result<()> {
    if probe_liveness(url, timeout).await? {
        writeln!(out, "{url}: healthy")?;
        Ok(())
    } else {
        writeln!(out, "{url}: unhealthy")?;
        bail!("{url} did not answer GET / with 200")
    }
}

/// `teegate watch`. Runs until Ctrl-C.
pub async fn watch<W: Write>(out: &mut W, config: &GateConfig) -> anyhow::Result<()> {
    let gate = Arc::new(config.build_gate()?);
    info!(gate = ?gate, "starting secure gate");
    let handle = spawn_reverifier(Arc::clone(&gate), config.reverify_config());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    handle.shutdown().await;

    let snapshot = gate.snapshot();
    if snapshot.requires_intervention {
        warn!(
            failures = snapshot.consecutive_failures,
            "gate stopped while waiting for operator intervention"
        );
    }
    writeln!(
        out,
        "final state: {} (verified at {})",
        snapshot.state,
        snapshot
            .verified_at()
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const PCR0: &str = "0d8c50f0d0e9ecf25c48ba9ed1d8d5dc475be1dba553a0ef299f385bd7447220";
    const PCR1: &str = "d71f06f25bcd891848eecfcd65688831d9acf4be17da631b15fb5b1ecd7c3d23";
    const PCR2: &str = "bd79abe09f36d95bb28c08d6f9d758c3bddebc6aa634b8c65cbae4b4b54a4146";

    fn write_fixture(dir: &Path, pcr0: &str) -> PathBuf {
        let reference = dir.join("reference.toml");
        std::fs::write(
            &reference,
            format!(
                "[[preset]]\narch = \"arm64\"\nversion = \"v1.0.0\"\n[preset.measurements]\npcr0 = \"{PCR0}\"\npcr1 = \"{PCR1}\"\npcr2 = \"{PCR2}\"\n"
            ),
        )
        .expect("reference");

        let record = dir.join("attestation.json");
        let timestamp = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        std::fs::write(
            &record,
            format!(
                r#"{{"job_id":"job-1","timestamp":"{timestamp}","network":"arbitrum",
                    "measurements":{{"pcr0":"{pcr0}","pcr1":"{PCR1}","pcr2":"{PCR2}"}}}}"#
            ),
        )
        .expect("record");

        let config = dir.join("teegate.toml");
        std::fs::write(
            &config,
            format!(
                "[validation]\nrequire_quote = false\n\n[binding]\npreset = \"arm64/v1.0.0\"\nreference_file = \"{}\"\n",
                reference.display()
            ),
        )
        .expect("config");
        config
    }

    #[test]
    fn digest_prints_hex_and_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("compose.yml");
        std::fs::write(&file, b"abc").expect("write");

        let mut out = Vec::new();
        digest(&mut out, &file).expect("digest");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  "));
    }

    #[test]
    fn digest_missing_file_fails() {
        let mut out = Vec::new();
        assert!(digest(&mut out, Path::new("/nonexistent/compose.yml")).is_err());
    }

    #[test]
    fn init_config_writes_valid_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conf").join("teegate.toml");
        let mut out = Vec::new();
        init_config(&mut out, &path, false).expect("init");
        assert!(GateConfig::from_file(&path).is_ok());

        assert!(init_config(&mut out, &path, false).is_err(), "refuses to overwrite");
        init_config(&mut out, &path, true).expect("force overwrite");
    }

    #[tokio::test]
    async fn verify_accepts_matching_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = write_fixture(dir.path(), PCR0);
        let config =
            load_config(&config_path, Some(dir.path().join("attestation.json"))).expect("config");

        let mut out = Vec::new();
        verify(&mut out, &config, Format::Text).await.expect("verified");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("overall: VERIFIED"), "{text}");
        assert!(text.contains("quote_verification"));
    }

    #[tokio::test]
    async fn verify_rejects_mismatch_with_json_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = write_fixture(dir.path(), &"a".repeat(64));
        let config =
            load_config(&config_path, Some(dir.path().join("attestation.json"))).expect("config");

        let mut out = Vec::new();
        let err = verify(&mut out, &config, Format::Json).await.expect_err("rejected");
        assert!(err.to_string().contains("measurement_equality=fail"));

        let report: serde_json::Value =
            serde_json::from_slice(&out).expect("report is JSON");
        assert_eq!(report["overall"], false);
    }

    #[tokio::test]
    async fn probe_unreachable_fails() {
        let mut out = Vec::new();
        let result = probe(&mut out, "http://127.0.0.1:1", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
