//! Server configuration model

use std::path::PathBuf;
use std::time::Duration;

use derive_setters::Setters;
use serde::{Deserialize, Serialize};

use crate::ValidationError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Configuration for the LSIF server process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Setters)]
#[setters(strip_option, into)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the HTTP server listens on
    pub http_port: u16,
    /// Directory holding uploads, converted databases and temp files
    pub storage_root: PathBuf,
    /// Soft limit on total bytes stored under `storage_root`. A single file
    /// larger than this limit is still accepted.
    pub soft_max_storage: u64,
    /// Largest accepted upload, in bytes
    pub max_file_size: u64,
    /// Soft limit on the memory held by open databases, in bytes
    pub cache_capacity: u64,
    /// Location of the shared queue backend (`sqlite://<path>` or `memory://`).
    /// A SQLite queue is shared by every server whose `queue_url` names the
    /// same file, so a fleet needs a common filesystem for it.
    pub queue_url: String,
    /// Prefix applied to every queue and lease name
    pub queue_namespace: String,
    /// How often the scheduler tries to acquire or renew its lease
    pub scheduler_poll_interval_secs: u64,
    /// How long a scheduler lease stays valid without renewal
    pub scheduler_lease_ttl_secs: u64,
    /// Workers silent for longer than this lose their in-flight jobs
    pub stale_worker_timeout_secs: u64,
    /// Temp files older than this are removed at startup
    pub temp_file_max_age_secs: u64,
    /// Whether to expose Prometheus metrics on `/metrics`
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3186,
            storage_root: PathBuf::from("lsif-storage"),
            soft_max_storage: 100 * GIB,
            max_file_size: 100 * MIB,
            cache_capacity: 100 * MIB,
            queue_url: "sqlite://lsif-queue.db".to_string(),
            queue_namespace: "lsif".to_string(),
            scheduler_poll_interval_secs: 5,
            scheduler_lease_ttl_secs: 60,
            stale_worker_timeout_secs: 600,
            temp_file_max_age_secs: 3600,
            metrics_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_interval_secs)
    }

    pub fn scheduler_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduler_lease_ttl_secs)
    }

    pub fn stale_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_worker_timeout_secs)
    }

    pub fn temp_file_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_file_max_age_secs)
    }

    /// Checks values that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("max_file_size", self.max_file_size),
            ("cache_capacity", self.cache_capacity),
            ("scheduler_poll_interval_secs", self.scheduler_poll_interval_secs),
            ("scheduler_lease_ttl_secs", self.scheduler_lease_ttl_secs),
            ("stale_worker_timeout_secs", self.stale_worker_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ValidationError::invalid_field(field, "must be greater than zero"));
            }
        }

        if self.scheduler_lease_ttl_secs <= self.scheduler_poll_interval_secs {
            return Err(ValidationError::invalid_field(
                "scheduler_lease_ttl_secs",
                "must be longer than scheduler_poll_interval_secs",
            ));
        }

        if self.queue_namespace.is_empty() {
            return Err(ValidationError::invalid_field("queue_namespace", "must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let fixture = ServerConfig::default();

        let actual = fixture.validate();

        assert_eq!(actual, Ok(()));
    }

    #[test]
    fn test_setters() {
        let fixture = ServerConfig::default()
            .http_port(8080u16)
            .storage_root("/var/lib/lsif")
            .cache_capacity(42u64);

        assert_eq!(fixture.http_port, 8080);
        assert_eq!(fixture.storage_root, PathBuf::from("/var/lib/lsif"));
        assert_eq!(fixture.cache_capacity, 42);
    }

    #[test]
    fn test_validate_rejects_short_lease() {
        let fixture = ServerConfig::default()
            .scheduler_poll_interval_secs(10u64)
            .scheduler_lease_ttl_secs(10u64);

        let actual = fixture.validate().unwrap_err();

        assert_eq!(actual.field(), "scheduler_lease_ttl_secs");
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let fixture = ServerConfig::default().max_file_size(0u64);

        let actual = fixture.validate().unwrap_err();

        assert_eq!(actual.field(), "max_file_size");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let actual: ServerConfig = serde_json::from_str(r#"{"http_port": 9000}"#).unwrap();
        let expected = ServerConfig::default().http_port(9000u16);

        assert_eq!(actual, expected);
    }
}
