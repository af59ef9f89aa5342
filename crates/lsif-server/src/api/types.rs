use lsif_domain::{Position, RepositoryCommit, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query parameters identifying an index
#[derive(Debug, Default, Deserialize)]
pub struct RepositoryQuery {
    pub repository: Option<String>,
    pub commit: Option<String>,
}

impl RepositoryQuery {
    pub fn key(&self) -> Result<RepositoryCommit, ValidationError> {
        RepositoryCommit::from_parts(self.repository.as_deref(), self.commit.as_deref())
    }
}

/// Query parameters for `/exists`
#[derive(Debug, Default, Deserialize)]
pub struct ExistsQuery {
    #[serde(flatten)]
    pub key: RepositoryQuery,
    pub file: Option<String>,
}

/// Body of `/request`, in either API generation.
///
/// Legacy clients send `{method, params: [path, position]}`, current ones
/// `{method, path, position}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQueryRequest {
    pub method: Option<String>,
    pub params: Option<Vec<Value>>,
    pub path: Option<String>,
    pub position: Option<Position>,
    pub include_declaration: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub pong: &'static str,
}

/// Error body for status-coded failures
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: &'static str,
}

/// Error body the legacy `/request` API returns with status 200
#[derive(Debug, Serialize)]
pub struct LegacyErrorResponse {
    pub error: String,
}
