use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::queue::ConversionQueue;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    pub queue: ConversionQueue,
    /// Cancelled when a handler hits an error the process cannot recover from
    pub fatal: CancellationToken,
    /// Present when `/metrics` is enabled
    pub metrics: Option<PrometheusHandle>,
}
