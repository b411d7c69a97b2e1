//! Persisted records shared by every store backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest indexed unit: a contiguous line range of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    #[serde(skip_serializing, default)]
    pub project_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Indexing record for one file. `chunk_ids` always equals the chunk set
/// stored for `(project_id, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub project_id: String,
    pub path: String,
    pub hash: String,
    /// Filesystem modification time, unix seconds.
    pub mtime: i64,
    pub chunk_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk paired with its relevance score. Higher is more relevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f32,
}

/// Per-project index totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_files: usize,
    pub total_chunks: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        Chunk {
            id: "c1".into(),
            project_id: "p1".into(),
            file_path: "src/lib.rs".into(),
            start_line: 1,
            end_line: 20,
            content: "fn login() {}\n".into(),
            hash: "abc".into(),
            updated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn search_result_serializes_flat_camel_case() {
        let result = SearchResult {
            chunk: sample_chunk(),
            score: 1.5,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["filePath"], "src/lib.rs");
        assert_eq!(json["startLine"], 1);
        assert_eq!(json["endLine"], 20);
        assert_eq!(json["hash"], "abc");
        assert_eq!(json["score"], 1.5);
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("projectId").is_none());
    }

    #[test]
    fn stats_serialize_camel_case() {
        let stats = StoreStats {
            total_files: 2,
            total_chunks: 7,
            last_updated: None,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalFiles"], 2);
        assert_eq!(json["totalChunks"], 7);
        assert!(json["lastUpdated"].is_null());
    }
}
