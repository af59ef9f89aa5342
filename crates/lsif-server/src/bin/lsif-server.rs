//! LSIF upload and query server

use anyhow::Result;
use clap::Parser;
use lsif_server::{LogFormat, init_default_logging, init_development_logging, init_production_logging};

mod server;

use server::{Args, run_server};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.log_format {
        Some(LogFormat::Json) => init_production_logging()?,
        Some(LogFormat::Pretty) => init_development_logging()?,
        None => init_default_logging()?,
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "Starting LSIF server"
    );

    run_server(args).await
}
