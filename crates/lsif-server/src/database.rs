//! Read-only handles over converted databases
//!
//! A [`Database`] eagerly loads the metadata row when opened and decodes
//! documents and result chunks on first use. Decoded payloads are kept for
//! the lifetime of the handle, which is what the cache weight of a handle
//! accounts for.

pub mod codec;
pub mod writer;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lsif_domain::{
    DocumentData, HoverResult, Location, MetaData, Position, RangeData, ResultChunkData, ResultId,
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

use crate::cache::Disposable;
use crate::sharding::hash_key;
use crate::store::FileGeneration;
use crate::{LsifError, Result};

pub use writer::{DatabaseWriter, IndexBuilder};

const MAX_CONNECTIONS: u32 = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Database {
    path: PathBuf,
    generation: FileGeneration,
    pool: SqlitePool,
    meta: MetaData,
    documents: Mutex<HashMap<String, Option<Arc<DocumentData>>>>,
    result_chunks: Mutex<HashMap<usize, Arc<ResultChunkData>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the converted database at `path` and loads its metadata.
    ///
    /// Anything that prevents reading the metadata is reported as
    /// [`LsifError::CorruptIndex`].
    pub async fn open(path: &Path, generation: FileGeneration) -> Result<Self> {
        let corrupt = |reason: &str, e: sqlx::Error| {
            LsifError::corrupt_index_with_source(path.display().to_string(), reason, e)
        };

        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| corrupt("cannot open database", e))?;

        let meta = match Self::load_meta(&pool, path).await {
            Ok(meta) => meta,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        debug!(path = %path.display(), num_result_chunks = meta.num_result_chunks, "Opened database");
        Ok(Self {
            path: path.to_path_buf(),
            generation,
            pool,
            meta,
            documents: Mutex::new(HashMap::new()),
            result_chunks: Mutex::new(HashMap::new()),
        })
    }

    async fn load_meta(pool: &SqlitePool, path: &Path) -> Result<MetaData> {
        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT lsif_version, server_version, num_result_chunks FROM meta LIMIT 1")
                .fetch_optional(pool)
                .await
                .map_err(|e| {
                    LsifError::corrupt_index_with_source(path.display().to_string(), "cannot read metadata", e)
                })?;

        let Some((lsif_version, server_version, num_result_chunks)) = row else {
            return Err(LsifError::corrupt_index(path.display().to_string(), "missing metadata"));
        };

        let num_result_chunks = u32::try_from(num_result_chunks)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                LsifError::corrupt_index(
                    path.display().to_string(),
                    format!("invalid result chunk count {num_result_chunks}"),
                )
            })?;

        Ok(MetaData { lsif_version, server_version, num_result_chunks })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> FileGeneration {
        self.generation
    }

    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    fn query_error(&self, operation: String, err: sqlx::Error) -> LsifError {
        match err {
            sqlx::Error::Database(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_) => {
                LsifError::corrupt_index_with_source(self.path.display().to_string(), operation, err)
            }
            other => LsifError::storage_error_with_source(operation, other),
        }
    }

    fn decode_error(&self, what: String, err: serde_json::Error) -> LsifError {
        LsifError::corrupt_index_with_source(self.path.display().to_string(), format!("cannot decode {what}"), err)
    }

    /// Returns the decoded document at `path`, or `None` if the index has no
    /// such document.
    async fn document(&self, path: &str) -> Result<Option<Arc<DocumentData>>> {
        if let Some(document) = lock(&self.documents).get(path) {
            return Ok(document.clone());
        }

        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT data FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.query_error(format!("read document {path}"), e))?;

        let document = blob
            .map(|blob| codec::decode::<DocumentData>(&blob).map(Arc::new))
            .transpose()
            .map_err(|e| self.decode_error(format!("document {path}"), e))?;

        lock(&self.documents).insert(path.to_string(), document.clone());
        Ok(document)
    }

    async fn result_chunk(&self, index: usize) -> Result<Arc<ResultChunkData>> {
        if let Some(chunk) = lock(&self.result_chunks).get(&index) {
            return Ok(chunk.clone());
        }

        let blob: Option<Vec<u8>> = sqlx::query_scalar("SELECT data FROM result_chunks WHERE id = ?")
            .bind(index as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.query_error(format!("read result chunk {index}"), e))?;

        let blob = blob.ok_or_else(|| {
            LsifError::corrupt_index(self.path.display().to_string(), format!("missing result chunk {index}"))
        })?;
        let chunk = Arc::new(
            codec::decode::<ResultChunkData>(&blob)
                .map_err(|e| self.decode_error(format!("result chunk {index}"), e))?,
        );

        lock(&self.result_chunks).insert(index, chunk.clone());
        Ok(chunk)
    }

    /// Resolves a definition or reference result to locations.
    async fn locations(&self, result_id: ResultId) -> Result<Vec<Location>> {
        let index = hash_key(result_id, i64::from(self.meta.num_result_chunks))?;
        let chunk = self.result_chunk(index).await?;
        let Some(pairs) = chunk.document_id_range_ids.get(&result_id) else {
            return Ok(Vec::new());
        };

        let mut locations = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let path = chunk.document_paths.get(&pair.document_id).ok_or_else(|| {
                LsifError::corrupt_index(
                    self.path.display().to_string(),
                    format!("unknown document id {} in result {result_id}", pair.document_id),
                )
            })?;
            let document = self.document(path).await?.ok_or_else(|| {
                LsifError::corrupt_index(self.path.display().to_string(), format!("missing document {path}"))
            })?;
            let range = document.ranges.get(&pair.range_id).ok_or_else(|| {
                LsifError::corrupt_index(
                    self.path.display().to_string(),
                    format!("unknown range {} in {path}", pair.range_id),
                )
            })?;
            locations.push(Location { uri: path.clone(), range: range.range() });
        }
        Ok(locations)
    }

    /// Innermost range at `position` that carries the wanted result.
    async fn find_range<T>(
        &self,
        path: &str,
        position: Position,
        select: impl Fn(&RangeData) -> Option<T>,
    ) -> Result<Option<(RangeData, T)>> {
        let Some(document) = self.document(path).await? else {
            return Ok(None);
        };
        let found = document
            .ranges_at(position)
            .into_iter()
            .find_map(|range| select(range).map(|value| (range.clone(), value)));
        Ok(found)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.document(path).await?.is_some())
    }

    pub async fn hover(&self, path: &str, position: Position) -> Result<Option<HoverResult>> {
        let Some(document) = self.document(path).await? else {
            return Ok(None);
        };

        let hover = document.ranges_at(position).into_iter().find_map(|range| {
            let text = document.hover_results.get(&range.hover_result_id?)?;
            Some(HoverResult::markdown(text.clone(), range.range()))
        });
        Ok(hover)
    }

    pub async fn definitions(&self, path: &str, position: Position) -> Result<Option<Vec<Location>>> {
        match self.find_range(path, position, |range| range.definition_result_id).await? {
            Some((_, result_id)) => Ok(Some(self.locations(result_id).await?)),
            None => Ok(None),
        }
    }

    /// References of the symbol at `position`. Without
    /// `include_declaration` the symbol's definitions are left out.
    pub async fn references(
        &self,
        path: &str,
        position: Position,
        include_declaration: bool,
    ) -> Result<Vec<Location>> {
        let Some((range, result_id)) =
            self.find_range(path, position, |range| range.reference_result_id).await?
        else {
            return Ok(Vec::new());
        };

        let mut locations = self.locations(result_id).await?;
        if !include_declaration {
            if let Some(definition_result) = range.definition_result_id {
                let definitions: HashSet<Location> =
                    self.locations(definition_result).await?.into_iter().collect();
                locations.retain(|location| !definitions.contains(location));
            }
        }
        Ok(locations)
    }
}

#[async_trait]
impl Disposable for Database {
    async fn dispose(&self) {
        debug!(path = %self.path.display(), "Closing database");
        self.pool.close().await;
    }
}
