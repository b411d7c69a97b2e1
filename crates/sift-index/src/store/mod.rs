//! Persistence and ranked retrieval.
//!
//! Both backends share one `SQLite` catalog for documents and chunks, so the
//! read shape is identical regardless of how results are scored:
//!
//! - [`StoreBackend::Lexical`]: FTS5 `bm25()` when the module is available,
//!   otherwise a built-in Okapi BM25 over an inverted-index table.
//! - [`StoreBackend::Vector`]: cosine similarity over embedded chunks, exact
//!   or through a Qdrant mirror.
//!
//! Scores from either path are non-negative and higher is better. A
//! structural path boost is applied afterwards, independent of the backend.

pub mod boost;
mod catalog;
pub mod embed;
mod error;
mod lexical;
#[cfg(feature = "qdrant")]
mod qdrant;
mod tokenize;
mod vector;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use boost::{BoostRule, PathBooster, default_rules};
pub use embed::{AnyEmbedder, Embedder, EmbedderConfig, EmbeddingProvider, HashingEmbedder};
pub use error::StoreError;

pub use lexical::LexicalStore;
pub use vector::VectorStore;

use crate::types::{Chunk, Document, SearchResult, StoreStats};
use catalog::Catalog;

/// Storage strategy, selected once per store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Lexical,
    Vector,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lexical" | "bm25" => Ok(Self::Lexical),
            "vector" => Ok(Self::Vector),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// Scoring path chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingMode {
    Fts5Bm25,
    BuiltinBm25,
    ExactCosine,
    QdrantAnn,
}

impl RankingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fts5Bm25 => "fts5-bm25",
            Self::BuiltinBm25 => "builtin-bm25",
            Self::ExactCosine => "exact-cosine",
            Self::QdrantAnn => "qdrant-ann",
        }
    }
}

impl std::fmt::Display for RankingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Catalog database file, or `:memory:`.
    pub sqlite_path: PathBuf,
    pub pool_size: u32,
    /// Use FTS5 when the module is present. Disable to force built-in BM25.
    pub accelerated_ranking: bool,
    /// Approximate nearest-neighbour mirror for the vector backend.
    pub qdrant_url: Option<String>,
    pub embedder: EmbedderConfig,
    pub boost_rules: Vec<BoostRule>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Lexical,
            sqlite_path: PathBuf::from(".sift/index.db"),
            pool_size: 5,
            accelerated_ranking: true,
            qdrant_url: None,
            embedder: EmbedderConfig::default(),
            boost_rules: default_rules(),
        }
    }
}

/// Generates a match over all `AnyStore` variants, binding the inner store
/// and evaluating the given expression for each arm.
macro_rules! delegate_store {
    ($self:expr, |$s:ident| $expr:expr) => {
        match $self {
            AnyStore::Lexical($s) => $expr,
            AnyStore::Vector($s) => $expr,
        }
    };
}

/// The store contract, dispatched to the backend chosen at construction.
///
/// Every operation is scoped by project id inside the query itself. Writes
/// are atomic per call: a dropped or failed call leaves the previous state.
#[derive(Debug)]
pub enum AnyStore {
    Lexical(LexicalStore),
    Vector(VectorStore),
}

impl AnyStore {
    /// Open the catalog, run migrations and detect optional capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, migrations fail,
    /// boost rules are invalid, or the embedder cannot be constructed.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let booster = PathBooster::new(&config.boost_rules)?;
        let catalog = Catalog::open(&config.sqlite_path, config.pool_size).await?;
        let store = match config.backend {
            StoreBackend::Lexical => Self::Lexical(
                LexicalStore::open(catalog, booster, config.accelerated_ranking).await,
            ),
            StoreBackend::Vector => Self::Vector(VectorStore::open(catalog, booster, config).await?),
        };
        tracing::info!(
            backend = ?config.backend,
            ranking = %store.ranking_mode(),
            path = %config.sqlite_path.display(),
            "store opened"
        );
        Ok(store)
    }

    #[must_use]
    pub fn ranking_mode(&self) -> RankingMode {
        delegate_store!(self, |s| s.ranking_mode())
    }

    /// Number of committed writes since the store was opened.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.catalog().mutation_count()
    }

    fn catalog(&self) -> &Catalog {
        delegate_store!(self, |s| s.catalog())
    }

    /// Upsert `doc` and replace its whole chunk set with `chunks` in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Invalid` when `doc.chunk_ids` does not equal the
    /// ids of `chunks`, or any chunk belongs to another file or project.
    pub async fn save_chunks(&self, doc: &Document, chunks: &[Chunk]) -> Result<(), StoreError> {
        delegate_store!(self, |s| s.save_chunks(doc, chunks).await)
    }

    /// Remove every chunk of a file. The document survives with an empty
    /// hash and chunk list, so the next reconciliation re-indexes it.
    ///
    /// Returns the number of chunks removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn delete_by_file(&self, project_id: &str, path: &str) -> Result<usize, StoreError> {
        delegate_store!(self, |s| s.delete_by_file(project_id, path).await)
    }

    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_document(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Option<Document>, StoreError> {
        self.catalog().get_document(project_id, path).await
    }

    /// Update document metadata without touching chunks.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Invalid` if `doc.chunk_ids` differs from the
    /// chunk set already stored for the path.
    pub async fn save_document(&self, doc: &Document) -> Result<(), StoreError> {
        let mut tx = self.catalog().pool().begin().await?;
        catalog::update_document_checked(&mut tx, doc).await?;
        tx.commit().await?;
        self.catalog().record_mutation();
        Ok(())
    }

    /// Remove a document and all of its chunks. Returns the number of chunks
    /// removed; a missing document is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn delete_document(&self, project_id: &str, path: &str) -> Result<usize, StoreError> {
        delegate_store!(self, |s| s.delete_document(project_id, path).await)
    }

    /// Indexed paths for a project, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn list_documents(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        self.catalog().list_documents(project_id).await
    }

    /// Ranked search within one project. An empty query yields no results.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be reached or the query embedding
    /// fails. Use [`StoreError::is_connectivity`] to tell the cases apart.
    pub async fn search(
        &self,
        project_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        delegate_store!(self, |s| s.search(project_id, query, limit).await)
    }

    /// [`search`](Self::search) that gives up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Cancelled` if the token fires first.
    pub async fn search_until_cancelled(
        &self,
        project_id: &str,
        query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, StoreError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StoreError::Cancelled),
            result = self.search(project_id, query, limit) => result,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_stats(&self, project_id: &str) -> Result<StoreStats, StoreError> {
        self.catalog().get_stats(project_id).await
    }

    /// Every chunk of a project ordered by path and start line.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_all_chunks(&self, project_id: &str) -> Result<Vec<Chunk>, StoreError> {
        self.catalog().get_all_chunks(project_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_chunks_for_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        self.catalog().get_chunks_for_file(project_id, path).await
    }

    /// Close the connection pool. Later calls fail with a connectivity error.
    pub async fn close(&self) {
        self.catalog().close().await;
        tracing::debug!("store closed");
    }
}

/// Candidates fetched before boosting so boosted hits survive truncation.
pub(crate) fn candidate_limit(limit: usize) -> usize {
    limit.saturating_mul(4).max(20)
}

/// Keep the best `n` base scores, ties broken by id for stable candidate sets.
pub(crate) fn top_candidates(mut scored: Vec<(String, f32)>, n: usize) -> Vec<(String, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(n);
    scored
}

/// Join scored ids with hydrated chunks, apply the path boost, sort and
/// truncate. Ids without a committed chunk are dropped.
pub(crate) fn finalize(
    scored: Vec<(String, f32)>,
    mut chunks: HashMap<String, Chunk>,
    booster: &PathBooster,
    limit: usize,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = scored
        .into_iter()
        .filter_map(|(id, base)| {
            let chunk = chunks.remove(&id)?;
            let score = base * booster.multiplier(&chunk.file_path);
            Some(SearchResult { chunk, score })
        })
        .collect();
    sort_results(&mut results);
    results.truncate(limit);
    results
}

/// Score descending, then file path ascending, then start line ascending.
pub(crate) fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
            .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(id: &str, path: &str, start: usize) -> Chunk {
        Chunk {
            id: id.into(),
            project_id: "p".into(),
            file_path: path.into(),
            start_line: start,
            end_line: start,
            content: String::new(),
            hash: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn candidate_limit_has_floor() {
        assert_eq!(candidate_limit(1), 20);
        assert_eq!(candidate_limit(10), 40);
        assert_eq!(candidate_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn ties_break_by_path_then_line() {
        let mut chunks = HashMap::new();
        chunks.insert("a".to_string(), chunk("a", "b.rs", 10));
        chunks.insert("b".to_string(), chunk("b", "a.rs", 30));
        chunks.insert("c".to_string(), chunk("c", "a.rs", 1));
        let scored = vec![("a".into(), 1.0), ("b".into(), 1.0), ("c".into(), 1.0)];
        let results = finalize(scored, chunks, &PathBooster::neutral(), 10);
        let order: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn boost_can_reorder_and_truncation_follows() {
        let booster = PathBooster::new(&[BoostRule::new("tests/**", 0.5)]).unwrap();
        let mut chunks = HashMap::new();
        chunks.insert("t".to_string(), chunk("t", "tests/foo.rs", 1));
        chunks.insert("s".to_string(), chunk("s", "src/foo.rs", 1));
        let scored = vec![("t".into(), 1.5), ("s".into(), 1.0)];
        let results = finalize(scored, chunks, &booster, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "s");
    }

    #[test]
    fn uncommitted_ids_dropped() {
        let mut chunks = HashMap::new();
        chunks.insert("a".to_string(), chunk("a", "a.rs", 1));
        let scored = vec![("ghost".into(), 9.0), ("a".into(), 1.0)];
        let results = finalize(scored, chunks, &PathBooster::neutral(), 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, "a");
    }

    #[test]
    fn top_candidates_stable() {
        let scored = vec![("b".into(), 1.0), ("a".into(), 1.0), ("c".into(), 2.0)];
        let top = top_candidates(scored, 2);
        assert_eq!(top, vec![("c".to_string(), 2.0), ("a".to_string(), 1.0)]);
    }

    #[test]
    fn backend_and_mode_names() {
        assert_eq!("Vector".parse::<StoreBackend>(), Ok(StoreBackend::Vector));
        assert!("sql".parse::<StoreBackend>().is_err());
        assert_eq!(
            serde_json::to_value(RankingMode::Fts5Bm25).unwrap(),
            serde_json::json!("fts5-bm25")
        );
        assert_eq!(RankingMode::QdrantAnn.to_string(), "qdrant-ann");
    }
}
