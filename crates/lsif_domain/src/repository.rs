//! Repository/commit identity and the on-disk key derived from it

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a full hexadecimal commit hash.
pub const COMMIT_LENGTH: usize = 40;

const REPOSITORY_PREFIX: &str = "base64repository:";
const COMMIT_SEPARATOR: &str = ",commit:";

/// Rejected user input. Always surfaces as a 4xx response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Must specify the repository (usually of the form github.com/user/repo)")]
    MissingRepository,

    #[error("Must specify the commit as a 40 character hash {0}")]
    InvalidCommit(String),

    #[error("Invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

impl ValidationError {
    /// Name of the offending field
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingRepository => "repository",
            Self::InvalidCommit(_) => "commit",
            Self::InvalidField { field, .. } => field,
        }
    }

    pub fn invalid_field(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField { field, message: message.into() }
    }
}

/// Identifies one uploaded index: a repository at a specific commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryCommit {
    repository: String,
    commit: String,
}

impl RepositoryCommit {
    /// Validates both halves of the key.
    ///
    /// The repository must be a non-empty string and the commit exactly 40
    /// lowercase hexadecimal characters.
    pub fn new(
        repository: impl Into<String>,
        commit: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let repository = repository.into();
        let commit = commit.into();

        if repository.is_empty() {
            return Err(ValidationError::MissingRepository);
        }
        if !is_valid_commit(&commit) {
            return Err(ValidationError::InvalidCommit(commit));
        }

        Ok(Self { repository, commit })
    }

    /// Validates optional query-string values, treating a missing value the
    /// same as an invalid one.
    pub fn from_parts(
        repository: Option<&str>,
        commit: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let repository = repository.ok_or(ValidationError::MissingRepository)?;
        let commit = commit.ok_or_else(|| ValidationError::InvalidCommit(String::new()))?;
        Self::new(repository, commit)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn disk_key(&self) -> DiskKey {
        DiskKey::from(self)
    }
}

impl fmt::Display for RepositoryCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.commit)
    }
}

/// Returns true if `commit` is a 40 character lowercase hex string.
pub fn is_valid_commit(commit: &str) -> bool {
    commit.len() == COMMIT_LENGTH
        && commit
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Filesystem-safe name derived from a [`RepositoryCommit`].
///
/// The repository is base64 encoded with the URL-safe alphabet, so the key
/// never contains a path separator and decodes back to exactly one
/// repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskKey(String);

impl DiskKey {
    /// Recovers a key from a stored file name with its extension removed.
    ///
    /// Returns `None` for names that were not produced by this type.
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let rest = stem.strip_prefix(REPOSITORY_PREFIX)?;
        let (encoded, commit) = rest.rsplit_once(COMMIT_SEPARATOR)?;
        if encoded.is_empty() || !is_valid_commit(commit) {
            return None;
        }
        URL_SAFE_NO_PAD.decode(encoded).ok()?;
        Some(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&RepositoryCommit> for DiskKey {
    fn from(key: &RepositoryCommit) -> Self {
        let encoded = URL_SAFE_NO_PAD.encode(key.repository.as_bytes());
        Self(format!(
            "{REPOSITORY_PREFIX}{encoded}{COMMIT_SEPARATOR}{}",
            key.commit
        ))
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const COMMIT: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_repository_commit_accepts_valid_input() {
        let fixture = RepositoryCommit::new("github.com/acme/widget", COMMIT).unwrap();

        let actual = fixture.to_string();
        let expected = format!("github.com/acme/widget@{COMMIT}");

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_repository_commit_rejects_bad_commits() {
        let fixtures = [
            "",
            "abc",
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            "gggggggggggggggggggggggggggggggggggggggg",
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            " aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ];

        for fixture in fixtures {
            let actual = RepositoryCommit::new("github.com/acme/widget", fixture);
            let expected = Err(ValidationError::InvalidCommit(fixture.to_string()));
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_repository_commit_rejects_missing_repository() {
        let actual_empty = RepositoryCommit::new("", COMMIT);
        let actual_missing = RepositoryCommit::from_parts(None, Some(COMMIT));

        assert_eq!(actual_empty, Err(ValidationError::MissingRepository));
        assert_eq!(actual_missing, Err(ValidationError::MissingRepository));
    }

    #[test]
    fn test_disk_key_is_deterministic_and_path_safe() {
        let fixture = RepositoryCommit::new("github.com/acme/widget?x=/y", COMMIT).unwrap();

        let actual = fixture.disk_key();

        assert_eq!(actual, fixture.disk_key());
        assert!(!actual.as_str().contains('/'));
        assert!(actual.as_str().ends_with(COMMIT));
    }

    #[test]
    fn test_disk_key_distinguishes_repositories() {
        let a = RepositoryCommit::new("github.com/acme/a", COMMIT).unwrap();
        let b = RepositoryCommit::new("github.com/acme/b", COMMIT).unwrap();

        assert_ne!(a.disk_key(), b.disk_key());
    }

    #[test]
    fn test_disk_key_from_file_stem() {
        let fixture = RepositoryCommit::new("github.com/acme/widget", COMMIT).unwrap();
        let key = fixture.disk_key();

        let actual = DiskKey::from_file_stem(key.as_str());
        let expected = Some(key);

        assert_eq!(actual, expected);
        assert_eq!(DiskKey::from_file_stem("not-a-key"), None);
        assert_eq!(DiskKey::from_file_stem("base64repository:abc,commit:xyz"), None);
    }
}
