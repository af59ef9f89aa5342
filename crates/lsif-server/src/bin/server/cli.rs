use std::path::PathBuf;

use clap::Parser;
use lsif_domain::ServerConfig;
use lsif_server::LogFormat;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (toml, yaml or json). `LSIF_*` environment variables
    /// override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// HTTP listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding uploads, converted databases and temp files
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Log output format (pretty or json)
    #[arg(long)]
    pub log_format: Option<LogFormat>,
}

impl Args {
    /// Applies command line overrides on top of the loaded configuration.
    pub fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(port) = self.port {
            config = config.http_port(port);
        }
        if let Some(root) = &self.storage_root {
            config = config.storage_root(root.clone());
        }
        config
    }
}
