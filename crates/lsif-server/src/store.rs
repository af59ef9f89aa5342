//! Disk store for raw uploads and converted databases
//!
//! Layout under the storage root:
//!
//! ```text
//! uploads/<disk key>.lsif.gz   raw dumps, always gzip
//! dbs/<disk key>.lsif.db       converted databases
//! tmp/                         in-progress writes
//! ```
//!
//! Every file becomes visible through an atomic rename out of `tmp/`, so
//! readers never observe a partial write.

mod bounded;
mod gzip;

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub use bounded::BoundedStream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use lsif_domain::{DiskKey, RepositoryCommit};
use metrics::counter;
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{LsifError, Result};

const UPLOADS_DIR: &str = "uploads";
const DATABASES_DIR: &str = "dbs";
const TEMP_DIR: &str = "tmp";

/// The two kinds of file kept per repository@commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Upload,
    Database,
}

impl FileKind {
    const ALL: [FileKind; 2] = [FileKind::Upload, FileKind::Database];

    fn dir(self) -> &'static str {
        match self {
            Self::Upload => UPLOADS_DIR,
            Self::Database => DATABASES_DIR,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Upload => ".lsif.gz",
            Self::Database => ".lsif.db",
        }
    }
}

/// A file owned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub kind: FileKind,
    pub key: DiskKey,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Identifies one version of a file. A replaced file gets a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileGeneration {
    pub size: u64,
    pub modified: SystemTime,
}

impl StoredFile {
    pub fn generation(&self) -> FileGeneration {
        FileGeneration { size: self.size, modified: self.modified }
    }

    fn from_metadata(kind: FileKind, key: DiskKey, path: PathBuf, metadata: &std::fs::Metadata) -> Self {
        Self {
            kind,
            key,
            path,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }
}

/// Result of a successful [`DiskStore::put`].
#[derive(Debug)]
pub struct PutOutcome {
    pub file: StoredFile,
    /// Files deleted to make room for the upload
    pub evicted: Vec<StoredFile>,
}

pub struct DiskStore {
    root: PathBuf,
    soft_max_bytes: u64,
    max_file_size: u64,
    /// Serializes budget scans so two of them never delete the same files
    budget: Mutex<()>,
}

fn storage_error(operation: &str, path: &Path, err: io::Error) -> LsifError {
    LsifError::storage_error_with_source(format!("{operation} {}", path.display()), err)
}

impl DiskStore {
    /// Opens the store rooted at `root`, creating its directories.
    pub async fn open(root: impl Into<PathBuf>, soft_max_bytes: u64, max_file_size: u64) -> Result<Self> {
        let root = root.into();
        for dir in [UPLOADS_DIR, DATABASES_DIR, TEMP_DIR] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| storage_error("create directory", &path, e))?;
        }

        info!(root = %root.display(), soft_max_bytes, max_file_size, "Disk store opened");
        Ok(Self { root, soft_max_bytes, max_file_size, budget: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn path(&self, kind: FileKind, key: &DiskKey) -> PathBuf {
        self.root.join(kind.dir()).join(format!("{key}{}", kind.extension()))
    }

    /// Creates an empty temp file that is deleted unless installed.
    pub fn temp_file(&self) -> Result<TempPath> {
        let dir = self.temp_dir();
        NamedTempFile::new_in(&dir)
            .map(NamedTempFile::into_temp_path)
            .map_err(|e| storage_error("create temp file in", &dir, e))
    }

    /// Streams an upload into the store, replacing any previous upload for
    /// the same key.
    ///
    /// `declared` is the request's Content-Length, if any. A declared length
    /// over the maximum is rejected before any byte is read. The body is cut
    /// off as soon as it runs past the declared length or the maximum.
    pub async fn put<S, E>(&self, key: &RepositoryCommit, declared: Option<u64>, body: S) -> Result<PutOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(size) = declared {
            if size > self.max_file_size {
                counter!("lsif_uploads_rejected_total", "reason" => "too_large").increment(1);
                return Err(LsifError::PayloadTooLarge { size, max: self.max_file_size });
            }
        }

        let raw = self.write_temp(declared, body).await.inspect_err(|e| {
            if matches!(e, LsifError::PayloadTooLarge { .. } | LsifError::SizeMismatch { .. }) {
                counter!("lsif_uploads_rejected_total", "reason" => e.error_code()).increment(1);
            }
        })?;

        let temp_dir = self.temp_dir();
        let max_decoded = self.max_file_size.saturating_mul(gzip::MAX_DECOMPRESSION_RATIO);
        let normalized = tokio::task::spawn_blocking(move || gzip::normalize(raw, &temp_dir, max_decoded))
            .await
            .map_err(|e| LsifError::storage_error_with_source("normalize upload", e))??;

        let size = tokio::fs::metadata(&normalized)
            .await
            .map_err(|e| storage_error("stat", &normalized, e))?
            .len();

        let evicted = self.evict_oldest(self.soft_max_bytes.saturating_sub(size), false).await?;
        let file = self.install(FileKind::Upload, &key.disk_key(), normalized).await?;

        counter!("lsif_uploads_accepted_total").increment(1);
        counter!("lsif_upload_bytes_total").increment(file.size);
        Ok(PutOutcome { file, evicted })
    }

    async fn write_temp<S, E>(&self, declared: Option<u64>, body: S) -> Result<TempPath>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let temp = NamedTempFile::new_in(self.temp_dir())
            .map_err(|e| storage_error("create temp file in", &self.temp_dir(), e))?;
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut body = BoundedStream::new(body, declared, self.max_file_size);
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await.map_err(|e| storage_error("write", &path, e))?;
        }
        file.flush().await.map_err(|e| storage_error("flush", &path, e))?;

        debug!(bytes = body.seen(), path = %path.display(), "Upload body written");
        Ok(path)
    }

    /// Atomically moves `temp` into place for `key`, replacing any previous
    /// file of the same kind.
    pub async fn install(&self, kind: FileKind, key: &DiskKey, temp: TempPath) -> Result<StoredFile> {
        let dest = self.path(kind, key);
        let target = dest.clone();
        tokio::task::spawn_blocking(move || temp.persist(&target))
            .await
            .map_err(|e| LsifError::storage_error_with_source("install file", e))?
            .map_err(|e| storage_error("rename into", &dest, e.error))?;

        let metadata = tokio::fs::metadata(&dest)
            .await
            .map_err(|e| storage_error("stat", &dest, e))?;
        debug!(path = %dest.display(), size = metadata.len(), "Installed file");
        Ok(StoredFile::from_metadata(kind, key.clone(), dest, &metadata))
    }

    /// Stats the file for `key`. A missing file is [`LsifError::NotFound`].
    pub async fn stat(&self, kind: FileKind, key: &RepositoryCommit) -> Result<StoredFile> {
        let disk_key = key.disk_key();
        let path = self.path(kind, &disk_key);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(StoredFile::from_metadata(kind, disk_key, path, &metadata)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LsifError::not_found(key)),
            Err(e) => Err(storage_error("stat", &path, e)),
        }
    }

    pub async fn exists(&self, kind: FileKind, key: &RepositoryCommit) -> Result<bool> {
        match self.stat(kind, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Opens the file for `key` for reading.
    pub async fn read(&self, kind: FileKind, key: &RepositoryCommit) -> Result<tokio::fs::File> {
        let path = self.path(kind, &key.disk_key());
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LsifError::not_found(key)),
            Err(e) => Err(storage_error("open", &path, e)),
        }
    }

    /// Deletes the file for `key`. Returns whether a file was removed.
    pub async fn delete(&self, kind: FileKind, key: &RepositoryCommit) -> Result<bool> {
        let path = self.path(kind, &key.disk_key());
        remove_file(&path).await
    }

    /// Every upload and database in the store.
    pub async fn list(&self) -> Result<Vec<StoredFile>> {
        let mut files = Vec::new();
        for kind in FileKind::ALL {
            let dir = self.root.join(kind.dir());
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| storage_error("list", &dir, e))?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| storage_error("list", &dir, e))? {
                let name = entry.file_name();
                let Some(key) = name
                    .to_str()
                    .and_then(|name| name.strip_suffix(kind.extension()))
                    .and_then(DiskKey::from_file_stem)
                else {
                    continue;
                };

                match entry.metadata().await {
                    Ok(metadata) if metadata.is_file() => {
                        files.push(StoredFile::from_metadata(kind, key, entry.path(), &metadata));
                    }
                    Ok(_) => {}
                    // Deleted between listing and stat
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(storage_error("stat", &entry.path(), e)),
                }
            }
        }
        Ok(files)
    }

    /// Total bytes held by uploads and databases.
    pub async fn usage(&self) -> Result<u64> {
        Ok(self.list().await?.iter().map(|file| file.size).sum())
    }

    /// Deletes files oldest-modified first until total usage is at or under
    /// `max_bytes`.
    ///
    /// The newest file is never deleted, so a single file larger than the
    /// budget survives. Returns the deleted files.
    pub async fn enforce_budget(&self, max_bytes: u64) -> Result<Vec<StoredFile>> {
        self.evict_oldest(max_bytes, true).await
    }

    async fn evict_oldest(&self, max_bytes: u64, keep_newest: bool) -> Result<Vec<StoredFile>> {
        let _guard = self.budget.lock().await;

        let mut files = self.list().await?;
        let mut usage: u64 = files.iter().map(|file| file.size).sum();
        if usage <= max_bytes {
            return Ok(Vec::new());
        }

        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        let keep = usize::from(keep_newest);
        let deletable = files.len().saturating_sub(keep);

        let mut evicted = Vec::new();
        for file in files.into_iter().take(deletable) {
            if usage <= max_bytes {
                break;
            }
            if remove_file(&file.path).await? {
                info!(path = %file.path.display(), size = file.size, "Evicted file over storage budget");
                counter!("lsif_disk_evictions_total").increment(1);
                counter!("lsif_disk_evicted_bytes_total").increment(file.size);
            }
            usage -= file.size;
            evicted.push(file);
        }

        if usage > max_bytes {
            warn!(usage, max_bytes, "Storage usage remains over budget");
        }
        Ok(evicted)
    }

    /// Removes temp files last modified more than `max_age` ago.
    ///
    /// Temp files are normally deleted when their write finishes or is
    /// abandoned. This catches files left behind by a crashed process.
    pub async fn sweep_temp(&self, max_age: Duration) -> Result<usize> {
        let dir = self.temp_dir();
        let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| storage_error("list", &dir, e))?;

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage_error("list", &dir, e))? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let stale = metadata.modified().map(|modified| modified <= cutoff).unwrap_or(true);
            if metadata.is_file() && stale && remove_file(&entry.path()).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Removed stale temp files");
        }
        Ok(removed)
    }
}

async fn remove_file(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(storage_error("delete", path, e)),
    }
}
