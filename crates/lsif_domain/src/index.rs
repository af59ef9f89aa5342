//! Payloads stored inside a converted database
//!
//! A converted database holds one metadata row, one [`DocumentData`] blob per
//! document path and `num_result_chunks` [`ResultChunkData`] blobs. Definition
//! and reference results live in the chunk selected by hashing the result id,
//! so a query only has to decode the chunk it needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Position, Range};

/// Identifier of a range within its document.
pub type RangeId = u64;
/// Identifier of a definition or reference result set.
pub type ResultId = u64;
/// Identifier of a document within a result chunk.
pub type DocumentId = u64;
/// Identifier of a hover result within its document.
pub type HoverResultId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub lsif_version: String,
    pub server_version: String,
    pub num_result_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeData {
    pub start_line: u32,
    pub start_character: u32,
    pub end_line: u32,
    pub end_character: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_result_id: Option<ResultId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_result_id: Option<ResultId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hover_result_id: Option<HoverResultId>,
}

impl RangeData {
    pub fn new(range: Range) -> Self {
        Self {
            start_line: range.start.line,
            start_character: range.start.character,
            end_line: range.end.line,
            end_character: range.end.character,
            definition_result_id: None,
            reference_result_id: None,
            hover_result_id: None,
        }
    }

    pub fn range(&self) -> Range {
        Range::new(
            Position::new(self.start_line, self.start_character),
            Position::new(self.end_line, self.end_character),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentData {
    pub ranges: BTreeMap<RangeId, RangeData>,
    pub hover_results: BTreeMap<HoverResultId, String>,
}

impl DocumentData {
    /// Ranges containing `position`, innermost first.
    pub fn ranges_at(&self, position: Position) -> Vec<&RangeData> {
        let mut ranges: Vec<&RangeData> = self
            .ranges
            .values()
            .filter(|data| data.range().contains(position))
            .collect();
        // Nested ranges start no earlier and end no later than their parents.
        ranges.sort_by(|a, b| {
            let (a, b) = (a.range(), b.range());
            b.start.cmp(&a.start).then(a.end.cmp(&b.end))
        });
        ranges
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentIdRangeId {
    pub document_id: DocumentId,
    pub range_id: RangeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultChunkData {
    pub document_paths: BTreeMap<DocumentId, String>,
    pub document_id_range_ids: BTreeMap<ResultId, Vec<DocumentIdRangeId>>,
}
