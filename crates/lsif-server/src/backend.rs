//! Facade tying the disk store to the database handle cache

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use lsif_domain::{DiskKey, RepositoryCommit};
use tracing::{debug, info};

use crate::cache::{Cached, WeightedLruCache};
use crate::database::Database;
use crate::store::{DiskStore, FileKind, PutOutcome};
use crate::{LsifError, Result};

/// Decoded documents and result chunks take roughly three times the space of
/// the compressed file, so handles are charged three times the file size.
pub const MEMORY_INFLATION: u64 = 3;

pub type DatabaseCache = WeightedLruCache<DiskKey, Database, LsifError>;

pub struct Backend {
    store: Arc<DiskStore>,
    cache: DatabaseCache,
}

impl Backend {
    pub fn new(store: Arc<DiskStore>, cache_capacity: u64) -> Self {
        Self { store, cache: WeightedLruCache::new("databases", cache_capacity) }
    }

    pub fn store(&self) -> &Arc<DiskStore> {
        &self.store
    }

    pub fn cache(&self) -> &DatabaseCache {
        &self.cache
    }

    /// Returns a handle to the converted database for `key`.
    ///
    /// Fails with [`LsifError::NotFound`] when nothing has been converted for
    /// the key yet. A cached handle whose file has since been replaced is
    /// invalidated and reopened. A handle stays usable after it leaves the
    /// cache and is closed once its last holder drops it.
    pub async fn database(&self, key: &RepositoryCommit) -> Result<Arc<Cached<Database>>> {
        let file = self.store.stat(FileKind::Database, key).await?;
        let generation = file.generation();
        let weight = file.size.saturating_mul(MEMORY_INFLATION);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let path = file.path.clone();
            let database = self
                .cache
                .get_or_create(file.key.clone(), weight, move || {
                    let path = path.clone();
                    async move { Database::open(&path, generation).await }
                })
                .await?;

            let cached = database.generation();
            let stale = cached != generation && cached.modified <= generation.modified;
            if !stale || attempts > 1 {
                return Ok(database);
            }

            debug!(key = %key, "Cached database was replaced on disk, reopening");
            self.cache.invalidate(&file.key).await;
        }
    }

    /// Whether a converted database exists for `key` and, when `path` is
    /// given, whether it contains that document. Missing data is `false`.
    pub async fn exists(&self, key: &RepositoryCommit, path: Option<&str>) -> Result<bool> {
        let database = match self.database(key).await {
            Ok(database) => database,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        match path {
            Some(path) => database.exists(path).await,
            None => Ok(true),
        }
    }

    /// Stores an upload and drops every cached handle it makes obsolete: the
    /// handle for `key` itself and those of databases evicted for space.
    pub async fn store_upload<S, E>(&self, key: &RepositoryCommit, declared: Option<u64>, body: S) -> Result<PutOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let outcome = self.store.put(key, declared, body).await?;

        self.cache.invalidate(&key.disk_key()).await;
        for file in outcome.evicted.iter().filter(|file| file.kind == FileKind::Database) {
            self.cache.invalidate(&file.key).await;
        }

        info!(
            key = %key,
            bytes = outcome.file.size,
            evicted = outcome.evicted.len(),
            "Stored upload"
        );
        Ok(outcome)
    }

    /// Disposes every cached handle.
    pub async fn shutdown(&self) {
        self.cache.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use lsif_domain::{HoverResult, Position, Range};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::database::{DatabaseWriter, IndexBuilder};

    const COMMIT: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn key() -> RepositoryCommit {
        RepositoryCommit::new("github.com/acme/widget", COMMIT).unwrap()
    }

    fn index(hover: &str) -> IndexBuilder {
        let mut index = IndexBuilder::new();
        let range = index.add_range("foo.go", Range::new(Position::new(3, 4), Position::new(3, 7)));
        index.set_hover("foo.go", range, hover).unwrap();
        index
    }

    async fn backend(capacity: u64) -> (tempfile::TempDir, Backend) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1 << 30, 1 << 20).await.unwrap();
        (dir, Backend::new(Arc::new(store), capacity))
    }

    #[tokio::test]
    async fn test_missing_database_is_not_found() {
        let (_dir, backend) = backend(1 << 20).await;

        let actual = backend.database(&key()).await.unwrap_err();

        assert!(actual.is_not_found());
        assert!(!backend.exists(&key(), None).await.unwrap());
        assert!(!backend.exists(&key(), Some("foo.go")).await.unwrap());
    }

    #[tokio::test]
    async fn test_database_is_cached_with_inflated_weight() {
        let (_dir, backend) = backend(1 << 30).await;
        let file = DatabaseWriter::new().install(&index("a"), backend.store(), &key()).await.unwrap();

        let first = backend.database(&key()).await.unwrap();
        let second = backend.database(&key()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.cache().weight(), file.size * MEMORY_INFLATION);
        assert!(backend.exists(&key(), Some("foo.go")).await.unwrap());
        assert!(!backend.exists(&key(), Some("bar.go")).await.unwrap());
    }

    #[tokio::test]
    async fn test_replaced_database_is_reopened() {
        let (_dir, backend) = backend(1 << 30).await;
        DatabaseWriter::new().install(&index("old"), backend.store(), &key()).await.unwrap();
        let old = backend.database(&key()).await.unwrap();

        // Make sure the replacement gets a different modification time.
        tokio::time::sleep(Duration::from_millis(20)).await;
        DatabaseWriter::new().install(&index("new docs"), backend.store(), &key()).await.unwrap();
        let actual = backend.database(&key()).await.unwrap();

        assert!(!Arc::ptr_eq(&old, &actual));
        assert_eq!(
            actual.hover("foo.go", Position::new(3, 5)).await.unwrap(),
            Some(HoverResult::markdown("new docs", Range::new(Position::new(3, 4), Position::new(3, 7))))
        );
        assert_eq!(backend.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_invalidates_cached_handle() {
        let (_dir, backend) = backend(1 << 30).await;
        DatabaseWriter::new().install(&index("a"), backend.store(), &key()).await.unwrap();
        backend.database(&key()).await.unwrap();
        assert!(backend.cache().contains(&key().disk_key()));

        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"{}\n"))]);
        backend.store_upload(&key(), Some(3), body).await.unwrap();

        assert!(!backend.cache().contains(&key().disk_key()));
        assert_eq!(backend.cache().weight(), 0);
    }

    #[tokio::test]
    async fn test_evicted_handle_keeps_answering_queries() {
        let (_dir, backend) = backend(1).await;
        let other = RepositoryCommit::new("github.com/acme/other", COMMIT).unwrap();
        DatabaseWriter::new().install(&index("held"), backend.store(), &key()).await.unwrap();
        DatabaseWriter::new().install(&index("other"), backend.store(), &other).await.unwrap();
        let held = backend.database(&key()).await.unwrap();

        backend.database(&other).await.unwrap();
        tokio::task::yield_now().await;

        let actual = held.hover("foo.go", Position::new(3, 5)).await.unwrap();
        let expected = Some(HoverResult::markdown("held", Range::new(Position::new(3, 4), Position::new(3, 7))));

        assert!(!backend.cache().contains(&key().disk_key()));
        assert_eq!(actual, expected);
    }
}
