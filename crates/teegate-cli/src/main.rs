//! teegate - TEE attestation verification and secure gate.

use std::io;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use teegate_cli::cli::{Cli, Commands};
use teegate_cli::commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("teegate=info"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json.then(|| fmt::layer().json().with_writer(io::stderr)))
        .with((!cli.json).then(|| fmt::layer().with_writer(io::stderr)))
        .init();

    let mut stdout = io::stdout().lock();
    match cli.command {
        Commands::Digest { file } => commands::digest(&mut stdout, &file)?,
        Commands::Verify { config, record } => {
            let config = commands::load_config(&config, record)?;
            commands::verify(&mut stdout, &config, cli.format).await?;
        }
        Commands::Watch { config } => {
            let config = commands::load_config(&config, None)?;
            commands::watch(&mut stdout, &config).await?;
        }
        Commands::Probe { url, timeout_secs } => {
            commands::probe(&mut stdout, &url, Duration::from_secs(timeout_secs)).await?;
        }
        Commands::InitConfig { output, force } => {
            commands::init_config(&mut stdout, &output, force)?;
        }
    }

    Ok(())
}
