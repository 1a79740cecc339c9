//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// teegate - TEE attestation verification and secure gate.
#[derive(Parser, Debug, Clone)]
#[command(name = "teegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true, env = "TEEGATE_LOG_JSON")]
    pub json: bool,

    /// Output format for reports.
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the SHA-256 digest of a deployment descriptor.
    Digest {
        /// File to digest, read as raw bytes.
        file: PathBuf,
    },

    /// Run one verification pass and print the report.
    ///
    /// Exits non-zero if the attestation is rejected or cannot be fetched.
    Verify {
        /// Path to the gate configuration.
        #[arg(short, long, env = "TEEGATE_CONFIG", default_value = "teegate.toml")]
        config: PathBuf,

        /// Verify this record file instead of the configured sources.
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Keep the gate verified in the background until interrupted.
    Watch {
        /// Path to the gate configuration.
        #[arg(short, long, env = "TEEGATE_CONFIG", default_value = "teegate.toml")]
        config: PathBuf,
    },

    /// Probe a service's liveness endpoint (`GET /` must return 200).
    Probe {
        /// Base URL of the service.
        url: String,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Write a sample configuration file.
    InitConfig {
        /// Path to write the configuration to.
        #[arg(short, long, default_value = "teegate.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}
