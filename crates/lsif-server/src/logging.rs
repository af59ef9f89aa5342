//! Logging and tracing setup

use std::env;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("Invalid log format: {other}. Must be pretty or json")),
        }
    }
}

/// Logging configuration for the LSIF server
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level for this crate (trace, debug, info, warn, error)
    pub level: Level,
    /// Whether to include file and line numbers
    pub include_location: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to include timestamps
    pub include_timestamps: bool,
    /// Output format
    pub format: LogFormat,
    /// Whether to log spans (enter/exit)
    pub log_spans: bool,
    /// Environment filter string, overrides `level` when set
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_location: false,
            include_thread_ids: false,
            include_timestamps: true,
            format: LogFormat::Pretty,
            log_spans: false,
            env_filter: None,
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl LoggingConfig {
    /// Create a new logging configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.level);

        let format = if env_flag("LOG_JSON_FORMAT", false) {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        };

        Self {
            level,
            include_location: env_flag("LOG_INCLUDE_LOCATION", defaults.include_location),
            include_thread_ids: env_flag("LOG_INCLUDE_THREAD_IDS", defaults.include_thread_ids),
            include_timestamps: env_flag("LOG_INCLUDE_TIMESTAMPS", defaults.include_timestamps),
            format,
            log_spans: env_flag("LOG_SPANS", defaults.log_spans),
            env_filter: env::var("RUST_LOG").ok(),
        }
    }

    /// Initialize the global tracing subscriber
    pub fn init_tracing(&self) -> Result<()> {
        let env_filter = self.build_env_filter()?;
        let span_events = if self.log_spans {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        };

        let fmt_layer = match self.format {
            LogFormat::Json => {
                let layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(self.include_location)
                    .with_line_number(self.include_location)
                    .with_thread_ids(self.include_thread_ids)
                    .with_target(true)
                    .with_span_events(span_events);
                if self.include_timestamps {
                    layer.boxed()
                } else {
                    layer.without_time().boxed()
                }
            }
            LogFormat::Pretty => {
                let layer = fmt::layer()
                    .with_file(self.include_location)
                    .with_line_number(self.include_location)
                    .with_thread_ids(self.include_thread_ids)
                    .with_target(false)
                    .with_span_events(span_events);
                if self.include_timestamps {
                    layer.boxed()
                } else {
                    layer.without_time().boxed()
                }
            }
        };

        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;

        Ok(())
    }

    fn build_env_filter(&self) -> Result<EnvFilter> {
        let filter = if let Some(ref env_filter) = self.env_filter {
            EnvFilter::try_new(env_filter)?
        } else {
            EnvFilter::default()
                .add_directive(format!("lsif_server={}", self.level).parse()?)
                .add_directive("tower_http=info".parse()?)
                .add_directive("axum=info".parse()?)
                .add_directive("hyper=info".parse()?)
                .add_directive("sqlx=warn".parse()?)
        };

        Ok(filter)
    }
}

/// Initialize logging from the environment
pub fn init_default_logging() -> Result<()> {
    LoggingConfig::from_env().init_tracing()
}

/// Initialize production logging with JSON format
pub fn init_production_logging() -> Result<()> {
    let mut config = LoggingConfig::from_env();
    config.format = LogFormat::Json;
    config.include_location = false;
    config.log_spans = false;
    config.init_tracing()
}

/// Initialize development logging with pretty format
pub fn init_development_logging() -> Result<()> {
    let mut config = LoggingConfig::from_env();
    config.format = LogFormat::Pretty;
    config.include_location = true;
    config.level = Level::DEBUG;
    config.init_tracing()
}

/// Structured logging macros for common operations
#[macro_export]
macro_rules! log_operation_start {
    ($operation:expr, $($field:ident = $value:expr),*) => {
        tracing::info!(
            operation = $operation,
            status = "started",
            $($field = $value,)*
            "Operation started"
        );
    };
}

#[macro_export]
macro_rules! log_operation_success {
    ($operation:expr, $duration:expr, $($field:ident = $value:expr),*) => {
        tracing::info!(
            operation = $operation,
            status = "success",
            duration_ms = $duration.as_millis() as u64,
            $($field = $value,)*
            "Operation completed successfully"
        );
    };
}

#[macro_export]
macro_rules! log_operation_error {
    ($operation:expr, $error:expr, $($field:ident = $value:expr),*) => {
        tracing::error!(
            operation = $operation,
            status = "error",
            error = %$error,
            $($field = $value,)*
            "Operation failed"
        );
    };
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_filter_builds() {
        let fixture = LoggingConfig::default();

        let actual = fixture.build_env_filter();

        assert!(actual.is_ok());
    }
}
