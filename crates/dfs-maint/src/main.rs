use anyhow::Result;
use clap::Parser;
use dfs_maint::cli::Cli;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    tracing::debug!("dfs-maint starting, config {}", cli.config.display());

    let result = cli.run().await?;
    for line in &result.lines {
        println!("{}", line);
    }
    Ok(ExitCode::from(result.exit_code))
}
