use std::str::FromStr;

use lsif_domain::{Position, QueryMethod};
use serde_json::Value;

use super::types::RawQueryRequest;
use crate::{LsifError, Result};

/// Which generation of the `/request` API a body was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    Legacy,
    Current,
}

/// A `/request` body that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub version: ApiVersion,
    pub method: QueryMethod,
    pub path: String,
    pub position: Position,
    pub include_declaration: bool,
}

fn parse_method(method: Option<&str>) -> Result<QueryMethod> {
    let method = method.unwrap_or_default();
    QueryMethod::from_str(method).map_err(|_| LsifError::unsupported_method(method, QueryMethod::supported()))
}

fn parse_legacy_params(params: &[Value]) -> Result<(String, Position)> {
    let invalid = || LsifError::validation_error("params", "Must specify params as [path, position]");

    let path = params.first().and_then(Value::as_str).ok_or_else(invalid)?;
    let position = params
        .get(1)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(invalid)?;
    Ok((path.to_string(), position))
}

/// Validates a `/request` body. The method is checked first so an unknown
/// method is reported as such regardless of the other fields.
pub fn validate_query(raw: RawQueryRequest) -> Result<QueryRequest> {
    let method = parse_method(raw.method.as_deref())?;

    if let Some(params) = raw.params {
        let (path, position) = parse_legacy_params(&params)?;
        return Ok(QueryRequest {
            version: ApiVersion::Legacy,
            method,
            path,
            position,
            include_declaration: false,
        });
    }

    let path = raw
        .path
        .ok_or_else(|| LsifError::validation_error("path", "Must specify the path"))?;
    let position = raw
        .position
        .ok_or_else(|| LsifError::validation_error("position", "Must specify the position"))?;

    Ok(QueryRequest {
        version: ApiVersion::Current,
        method,
        path,
        position,
        include_declaration: raw.include_declaration.unwrap_or(false),
    })
}
