//! HTTP surface: `/ping`, `/upload`, `/exists`, `/request` and `/metrics`

pub mod handlers;
pub mod state;
pub mod types;
pub mod validation;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
pub use handlers::{exists_handler, metrics_handler, ping_handler, request_handler, upload_handler};
pub use state::AppState;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted `/request` body
pub const REQUEST_BODY_LIMIT: usize = 1024 * 1024;

/// Builds the application router. Upload bodies are bounded by the disk
/// store's maximum file size instead of a body limit.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/ping", get(ping_handler))
        .route("/upload", post(upload_handler))
        .route("/exists", get(exists_handler).post(exists_handler))
        .route(
            "/request",
            post(request_handler).layer(DefaultBodyLimit::max(REQUEST_BODY_LIMIT)),
        );

    if state.metrics.is_some() {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
