use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use lsif_domain::{ConversionJob, QueryMethod};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::AppState;
use super::types::{
    ErrorResponse, ExistsQuery, LegacyErrorResponse, PingResponse, RawQueryRequest, RepositoryQuery,
};
use super::validation::{ApiVersion, validate_query};
use crate::{LsifError, Result, log_operation_error, log_operation_start, log_operation_success};

impl IntoResponse for LsifError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = if status.is_server_error() {
            error!(
                error = %self,
                source = ?std::error::Error::source(&self).map(ToString::to_string),
                "Request failed"
            );
            "Internal server error".to_string()
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
            self.to_string()
        };

        (status, Json(ErrorResponse { message, code: self.error_code() })).into_response()
    }
}

/// Liveness probe
pub async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse { pong: "pong" })
}

/// Stores a raw dump and enqueues its conversion
pub async fn upload_handler(
    State(state): State<AppState>,
    Query(query): Query<RepositoryQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Value>> {
    let request_id = Uuid::new_v4().to_string();
    let key = query.key()?;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let start = Instant::now();
    log_operation_start!(
        "upload",
        request_id = request_id.as_str(),
        repository = key.repository(),
        commit = key.commit()
    );

    let outcome = match state
        .backend
        .store_upload(&key, declared, Box::pin(body.into_data_stream()))
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.http_status_code() < 500 {
                warn!(request_id = %request_id, error = %e, "Upload rejected");
            } else {
                log_operation_error!("upload", e, request_id = request_id.as_str());
            }
            return Err(e);
        }
    };

    let job = ConversionJob::new(&key, &outcome.file.path);
    if let Err(e) = state.queue.enqueue(&job).await {
        log_operation_error!("upload", e, request_id = request_id.as_str());
        if e.is_fatal() {
            state.fatal.cancel();
        }
        return Err(e);
    }

    log_operation_success!(
        "upload",
        start.elapsed(),
        request_id = request_id.as_str(),
        bytes = outcome.file.size
    );
    Ok(Json(Value::Null))
}

/// Whether a converted index, or one file within it, exists
pub async fn exists_handler(
    State(state): State<AppState>,
    Query(query): Query<ExistsQuery>,
) -> Result<Json<bool>> {
    let key = query.key.key()?;
    let exists = state.backend.exists(&key, query.file.as_deref()).await?;

    debug!(key = %key, file = ?query.file, exists, "Exists check");
    Ok(Json(exists))
}

/// Answers a hover, definitions or references query
pub async fn request_handler(
    State(state): State<AppState>,
    Query(query): Query<RepositoryQuery>,
    payload: std::result::Result<Json<RawQueryRequest>, JsonRejection>,
) -> Result<Response> {
    let request_id = Uuid::new_v4().to_string();
    let key = query.key()?;
    let Json(raw) = payload.map_err(|e| LsifError::validation_error("body", e.body_text()))?;
    let request = validate_query(raw)?;
    let start = Instant::now();

    let database = match state.backend.database(&key).await {
        Ok(database) => database,
        Err(e) if e.is_not_found() && request.version == ApiVersion::Legacy => {
            debug!(request_id = %request_id, key = %key, "No data for legacy request");
            let error = format!("No LSIF data available for {key}.");
            return Ok(Json(LegacyErrorResponse { error }).into_response());
        }
        Err(e) => return Err(e),
    };

    let (path, position) = (request.path.as_str(), request.position);
    let result = match request.method {
        QueryMethod::Hover => serde_json::to_value(database.hover(path, position).await?),
        QueryMethod::Definitions => serde_json::to_value(database.definitions(path, position).await?),
        QueryMethod::References => serde_json::to_value(
            database.references(path, position, request.include_declaration).await?,
        ),
    }
    .map_err(|e| LsifError::internal_error(format!("cannot encode query result: {e}")))?;

    info!(
        request_id = %request_id,
        key = %key,
        method = %request.method,
        path,
        found = !result.is_null(),
        processing_time_ms = start.elapsed().as_millis() as u64,
        "Query completed"
    );

    if result.is_null() && request.version == ApiVersion::Legacy {
        let error = "No result found".to_string();
        return Ok(Json(LegacyErrorResponse { error }).into_response());
    }
    Ok(Json(result).into_response())
}

/// Prometheus exposition
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
