#![warn(missing_docs)]

//! `trustfs-keytool` entry point.

use anyhow::Result;
use clap::Parser;
use trustfs_keytool::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    cli.run(&mut stdout).await
}
