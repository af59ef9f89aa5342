use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::RepositoryCommit;

/// Request to convert a raw uploaded dump into a queryable database.
///
/// Jobs for the same repository@commit are idempotent replacements: the
/// worker always writes to the same database location, so replaying a job
/// after a worker crash is safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionJob {
    pub repository: String,
    pub commit: String,
    pub raw_file_path: PathBuf,
}

impl ConversionJob {
    pub fn new(key: &RepositoryCommit, raw_file_path: impl Into<PathBuf>) -> Self {
        Self {
            repository: key.repository().to_string(),
            commit: key.commit().to_string(),
            raw_file_path: raw_file_path.into(),
        }
    }
}
