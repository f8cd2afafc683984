//! Crowdlend CLI entry point.
//!
//! Each subcommand is one screen of the platform: it loads what it needs,
//! performs at most one action, and prints the refreshed result. Session
//! credentials persist in a local SQLite file between invocations.

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use crowdlend::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load optional .env file (ignored if missing) so RUST_LOG can live there too.
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout is for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crowdlend=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    cli.apply_overrides(&mut config);

    cli::run(cli, config).await
}
