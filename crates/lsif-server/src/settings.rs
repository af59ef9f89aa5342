//! Layered configuration loading
//!
//! Sources, lowest precedence first: built-in defaults, an optional config
//! file, then `LSIF_*` environment variables (`LSIF_HTTP_PORT`,
//! `LSIF_STORAGE_ROOT`, `LSIF_SOFT_MAX_STORAGE`, ...).

use std::path::Path;

use config::{Config, Environment, File};
use lsif_domain::ServerConfig;
use tracing::debug;

use crate::{LsifError, Result};

pub const ENV_PREFIX: &str = "LSIF";

fn config_error(e: config::ConfigError) -> LsifError {
    LsifError::configuration_error_with_source("load", e)
}

/// Loads and validates the server configuration.
pub fn load_config(file: Option<&Path>) -> Result<ServerConfig> {
    let mut builder = Config::builder().add_source(Config::try_from(&ServerConfig::default()).map_err(config_error)?);

    if let Some(file) = file {
        debug!(path = %file.display(), "Loading config file");
        builder = builder.add_source(File::from(file).required(true));
    }

    let config: ServerConfig = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
        .and_then(Config::try_deserialize)
        .map_err(config_error)?;

    config
        .validate()
        .map_err(|e| LsifError::configuration_error_with_source(e.field(), e))?;
    Ok(config)
}
