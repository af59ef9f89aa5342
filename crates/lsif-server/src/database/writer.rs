//! Producer side of the converted database format

use std::collections::BTreeMap;
use std::path::Path;

use lsif_domain::{
    DocumentData, DocumentId, DocumentIdRangeId, MetaData, Range, RangeData, RangeId,
    RepositoryCommit, ResultChunkData, ResultId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use tracing::debug;

use super::codec;
use crate::sharding::hash_key;
use crate::store::{DiskStore, FileKind, StoredFile};
use crate::{LsifError, Result};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE meta (id INTEGER PRIMARY KEY, lsif_version TEXT NOT NULL, server_version TEXT NOT NULL, num_result_chunks INTEGER NOT NULL)",
    "CREATE TABLE documents (path TEXT PRIMARY KEY, data BLOB NOT NULL)",
    "CREATE TABLE result_chunks (id INTEGER PRIMARY KEY, data BLOB NOT NULL)",
];

/// In-memory model of one converted index, built up range by range.
#[derive(Debug, Default, Clone)]
pub struct IndexBuilder {
    documents: BTreeMap<String, DocumentData>,
    results: BTreeMap<ResultId, Vec<(String, RangeId)>>,
    next_id: u64,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn range_mut(&mut self, path: &str, range_id: RangeId) -> Result<&mut RangeData> {
        self.documents
            .get_mut(path)
            .and_then(|document| document.ranges.get_mut(&range_id))
            .ok_or_else(|| LsifError::internal_error(format!("unknown range {range_id} in {path}")))
    }

    /// Registers a document without ranges.
    pub fn add_document(&mut self, path: &str) -> &mut Self {
        self.documents.entry(path.to_string()).or_default();
        self
    }

    pub fn add_range(&mut self, path: &str, range: Range) -> RangeId {
        let id = self.next_id();
        self.documents
            .entry(path.to_string())
            .or_default()
            .ranges
            .insert(id, RangeData::new(range));
        id
    }

    pub fn set_hover(&mut self, path: &str, range_id: RangeId, markdown: impl Into<String>) -> Result<()> {
        let hover_id = self.next_id();
        self.range_mut(path, range_id)?.hover_result_id = Some(hover_id);
        if let Some(document) = self.documents.get_mut(path) {
            document.hover_results.insert(hover_id, markdown.into());
        }
        Ok(())
    }

    /// Creates a result set over existing ranges.
    pub fn add_result(&mut self, locations: &[(&str, RangeId)]) -> Result<ResultId> {
        for (path, range_id) in locations {
            self.range_mut(path, *range_id)?;
        }
        let id = self.next_id();
        let locations = locations.iter().map(|(path, range)| (path.to_string(), *range)).collect();
        self.results.insert(id, locations);
        Ok(id)
    }

    pub fn set_definition_result(&mut self, path: &str, range_id: RangeId, result: ResultId) -> Result<()> {
        self.range_mut(path, range_id)?.definition_result_id = Some(result);
        Ok(())
    }

    pub fn set_reference_result(&mut self, path: &str, range_id: RangeId, result: ResultId) -> Result<()> {
        self.range_mut(path, range_id)?.reference_result_id = Some(result);
        Ok(())
    }

    /// Links every listed range to one symbol. The reference result contains
    /// the definitions as well as the references.
    pub fn link_symbol(
        &mut self,
        definitions: &[(&str, RangeId)],
        references: &[(&str, RangeId)],
    ) -> Result<()> {
        let definition_result = self.add_result(definitions)?;
        let mut all = definitions.to_vec();
        all.extend(references.iter().filter(|location| !definitions.contains(location)));
        let reference_result = self.add_result(&all)?;

        for (path, range_id) in &all {
            self.set_definition_result(path, *range_id, definition_result)?;
            self.set_reference_result(path, *range_id, reference_result)?;
        }
        Ok(())
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Shards the result sets into `num_result_chunks` chunks.
    fn result_chunks(&self, num_result_chunks: u32) -> Result<Vec<ResultChunkData>> {
        let document_ids: BTreeMap<&str, DocumentId> = self
            .documents
            .keys()
            .zip(1..)
            .map(|(path, id)| (path.as_str(), id))
            .collect();

        let mut chunks = vec![ResultChunkData::default(); num_result_chunks as usize];
        for (result_id, locations) in &self.results {
            let chunk = &mut chunks[hash_key(result_id, i64::from(num_result_chunks))?];
            let mut pairs = Vec::with_capacity(locations.len());
            for (path, range_id) in locations {
                let document_id = document_ids
                    .get(path.as_str())
                    .copied()
                    .ok_or_else(|| LsifError::internal_error(format!("unknown document {path}")))?;
                chunk.document_paths.insert(document_id, path.clone());
                pairs.push(DocumentIdRangeId { document_id, range_id: *range_id });
            }
            chunk.document_id_range_ids.insert(*result_id, pairs);
        }
        Ok(chunks)
    }
}

/// Writes an [`IndexBuilder`] as a converted database file.
#[derive(Debug, Clone)]
pub struct DatabaseWriter {
    lsif_version: String,
    results_per_chunk: usize,
    num_result_chunks: Option<u32>,
}

impl Default for DatabaseWriter {
    fn default() -> Self {
        Self { lsif_version: "0.4.3".to_string(), results_per_chunk: 500, num_result_chunks: None }
    }
}

impl DatabaseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lsif_version(mut self, version: impl Into<String>) -> Self {
        self.lsif_version = version.into();
        self
    }

    /// Forces the number of result chunks instead of deriving it from the
    /// number of result sets.
    pub fn num_result_chunks(mut self, count: u32) -> Self {
        self.num_result_chunks = Some(count.max(1));
        self
    }

    fn chunk_count(&self, index: &IndexBuilder) -> u32 {
        self.num_result_chunks.unwrap_or_else(|| {
            let per_chunk = self.results_per_chunk.max(1);
            let count = index.result_count().div_ceil(per_chunk).max(1);
            u32::try_from(count).unwrap_or(u32::MAX)
        })
    }

    /// Writes the database to `path`, which must not hold a database yet.
    pub async fn write(&self, index: &IndexBuilder, path: &Path) -> Result<()> {
        let sql_err = |e: sqlx::Error| LsifError::storage_error_with_source(format!("write database {}", path.display()), e);
        let encode_err = |e: std::io::Error| LsifError::storage_error_with_source("encode database payload", e);

        let num_result_chunks = self.chunk_count(index);
        let meta = MetaData {
            lsif_version: self.lsif_version.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            num_result_chunks,
        };

        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .connect()
            .await
            .map_err(sql_err)?;

        let mut tx = conn.begin().await.map_err(sql_err)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await.map_err(sql_err)?;
        }

        sqlx::query("INSERT INTO meta (id, lsif_version, server_version, num_result_chunks) VALUES (1, ?, ?, ?)")
            .bind(&meta.lsif_version)
            .bind(&meta.server_version)
            .bind(i64::from(meta.num_result_chunks))
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        for (document_path, document) in &index.documents {
            sqlx::query("INSERT INTO documents (path, data) VALUES (?, ?)")
                .bind(document_path)
                .bind(codec::encode(document).map_err(encode_err)?)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
        }

        for (id, chunk) in index.result_chunks(num_result_chunks)?.iter().enumerate() {
            sqlx::query("INSERT INTO result_chunks (id, data) VALUES (?, ?)")
                .bind(id as i64)
                .bind(codec::encode(chunk).map_err(encode_err)?)
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
        }

        tx.commit().await.map_err(sql_err)?;
        conn.close().await.map_err(sql_err)?;

        debug!(
            path = %path.display(),
            documents = index.documents.len(),
            results = index.results.len(),
            num_result_chunks,
            "Wrote converted database"
        );
        Ok(())
    }

    /// Writes the database into a temp file and atomically installs it as
    /// the converted database for `key`.
    pub async fn install(&self, index: &IndexBuilder, store: &DiskStore, key: &RepositoryCommit) -> Result<StoredFile> {
        let temp = store.temp_file()?;
        self.write(index, &temp).await?;
        store.install(FileKind::Database, &key.disk_key(), temp).await
    }
}

#[cfg(test)]
mod tests {
    use lsif_domain::Position;
    use pretty_assertions::assert_eq;

    use super::*;

    fn range(line: u32, start: u32, end: u32) -> Range {
        Range::new(Position::new(line, start), Position::new(line, end))
    }

    #[test]
    fn test_link_symbol_sets_result_ids_on_every_range() {
        let mut fixture = IndexBuilder::new();
        let def = fixture.add_range("a.go", range(1, 0, 3));
        let usage = fixture.add_range("b.go", range(4, 2, 5));

        fixture.link_symbol(&[("a.go", def)], &[("b.go", usage)]).unwrap();

        let def_data = &fixture.documents["a.go"].ranges[&def];
        let use_data = &fixture.documents["b.go"].ranges[&usage];
        assert_eq!(def_data.definition_result_id, use_data.definition_result_id);
        assert_eq!(def_data.reference_result_id, use_data.reference_result_id);
        assert_eq!(fixture.result_count(), 2);
    }

    #[test]
    fn test_unknown_range_is_rejected() {
        let mut fixture = IndexBuilder::new();

        assert!(fixture.set_hover("a.go", 99, "docs").is_err());
        assert!(fixture.add_result(&[("a.go", 99)]).is_err());
    }

    #[test]
    fn test_result_chunks_place_results_by_hash() {
        let mut fixture = IndexBuilder::new();
        let a = fixture.add_range("a.go", range(1, 0, 3));
        let b = fixture.add_range("b.go", range(2, 0, 3));
        let first = fixture.add_result(&[("a.go", a)]).unwrap();
        let second = fixture.add_result(&[("b.go", b)]).unwrap();

        let actual = fixture.result_chunks(4).unwrap();

        assert_eq!(actual.len(), 4);
        let first_chunk = &actual[hash_key(first, 4).unwrap()];
        assert_eq!(
            first_chunk.document_id_range_ids[&first],
            vec![DocumentIdRangeId { document_id: 1, range_id: a }]
        );
        assert_eq!(first_chunk.document_paths[&1], "a.go");
        let second_chunk = &actual[hash_key(second, 4).unwrap()];
        assert_eq!(second_chunk.document_paths[&2], "b.go");
    }

    #[test]
    fn test_chunk_count_scales_with_results() {
        let mut fixture = IndexBuilder::new();
        let a = fixture.add_range("a.go", range(1, 0, 3));
        for _ in 0..1001 {
            fixture.add_result(&[("a.go", a)]).unwrap();
        }

        assert_eq!(DatabaseWriter::new().chunk_count(&fixture), 3);
        assert_eq!(DatabaseWriter::new().chunk_count(&IndexBuilder::new()), 1);
        assert_eq!(DatabaseWriter::new().num_result_chunks(0).chunk_count(&fixture), 1);
    }
}
