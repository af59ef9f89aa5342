//! Prometheus metrics recorder

use metrics::{Unit, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{LsifError, Result};

/// Installs the global Prometheus recorder and returns the handle used to
/// render `/metrics`. Can only succeed once per process.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| LsifError::configuration_error_with_source("metrics recorder", e))?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!("lsif_cache_hits_total", "Cache lookups served by an existing entry");
    describe_counter!("lsif_cache_misses_total", "Cache lookups that started a construction");
    describe_counter!("lsif_cache_evictions_total", "Entries evicted to stay within capacity");
    describe_gauge!("lsif_cache_weight_bytes", Unit::Bytes, "Total weight of cached entries");
    describe_gauge!("lsif_cache_capacity_bytes", Unit::Bytes, "Configured cache capacity");
    describe_counter!("lsif_disk_evictions_total", "Files deleted to stay within the storage budget");
    describe_counter!("lsif_disk_evicted_bytes_total", Unit::Bytes, "Bytes deleted to stay within the storage budget");
    describe_counter!("lsif_uploads_accepted_total", "Uploads stored");
    describe_counter!("lsif_uploads_rejected_total", "Uploads rejected for their size");
    describe_counter!("lsif_upload_bytes_total", Unit::Bytes, "Bytes of stored uploads");
    describe_counter!("lsif_jobs_enqueued_total", "Conversion jobs enqueued");
    describe_gauge!("lsif_scheduler_leader", "1 while this process holds the scheduler lease");
    describe_counter!("lsif_scheduler_requeued_jobs_total", "Jobs requeued from unresponsive workers");
}
