//! Vector backend: cosine similarity over embedded chunks.
//!
//! Vectors live in `chunk_vectors` next to the catalog, so an exact scan is
//! always possible. When a Qdrant mirror is reachable at construction it
//! serves approximate nearest-neighbour queries instead.

use sqlx::SqliteConnection;

use super::catalog::{self, Catalog};
use super::embed::{AnyEmbedder, Embedder, cosine_similarity, cosine_to_score};
#[cfg(feature = "qdrant")]
use super::qdrant::QdrantMirror;
use super::{
    PathBooster, RankingMode, StoreConfig, StoreError, candidate_limit, finalize, top_candidates,
};
use crate::context::contextualize_for_embedding;
use crate::types::{Chunk, Document, SearchResult};

#[derive(Debug)]
pub struct VectorStore {
    catalog: Catalog,
    booster: PathBooster,
    embedder: AnyEmbedder,
    dimension: usize,
    #[cfg(feature = "qdrant")]
    mirror: Option<QdrantMirror>,
}

impl VectorStore {
    pub(crate) async fn open(
        catalog: Catalog,
        booster: PathBooster,
        config: &StoreConfig,
    ) -> Result<Self, StoreError> {
        let embedder = AnyEmbedder::from_config(&config.embedder)?;
        let dimension = embedder.detect_dimension().await?;
        invalidate_foreign_dimensions(catalog.pool(), dimension).await?;

        #[cfg(feature = "qdrant")]
        let mirror = match config.qdrant_url.as_deref() {
            Some(url) => match QdrantMirror::connect(url, dimension).await {
                Ok(mirror) => Some(mirror),
                Err(e) => {
                    tracing::warn!("qdrant unreachable at {url}, using exact cosine search: {e}");
                    None
                }
            },
            None => None,
        };
        #[cfg(not(feature = "qdrant"))]
        if config.qdrant_url.is_some() {
            tracing::warn!("qdrant support not compiled in, using exact cosine search");
        }

        tracing::debug!(embedder = embedder.name(), dimension, "vector store ready");
        Ok(Self {
            catalog,
            booster,
            embedder,
            dimension,
            #[cfg(feature = "qdrant")]
            mirror,
        })
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn ranking_mode(&self) -> RankingMode {
        #[cfg(feature = "qdrant")]
        if self.mirror.is_some() {
            return RankingMode::QdrantAnn;
        }
        RankingMode::ExactCosine
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let vector = self.embedder.embed(text).await?;
        if vector.len() != self.dimension {
            return Err(StoreError::Embedding(format!(
                "{} returned {} dimensions, expected {}",
                self.embedder.name(),
                vector.len(),
                self.dimension
            )));
        }
        Ok(vector)
    }

    pub(crate) async fn save_chunks(
        &self,
        doc: &Document,
        chunks: &[Chunk],
    ) -> Result<(), StoreError> {
        catalog::validate_chunk_set(doc, chunks)?;

        // Embedding may be slow or remote; keep it outside the transaction.
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            vectors.push(self.embed(&contextualize_for_embedding(chunk)).await?);
        }

        let mut tx = self.catalog.pool().begin().await?;
        let stale = catalog::replace_chunks(&mut tx, doc, chunks).await?;
        for (chunk, vector) in chunks.iter().zip(&vectors) {
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, project_id, dim, vector) VALUES (?, ?, ?, ?) \
                 ON CONFLICT (chunk_id) DO UPDATE SET dim = excluded.dim, vector = excluded.vector",
            )
            .bind(&chunk.id)
            .bind(&chunk.project_id)
            .bind(catalog::to_i64(vector.len())?)
            .bind(encode_vector(vector))
            .execute(&mut *tx)
            .await?;
        }
        // A mirror failure drops `tx` and rolls the catalog back.
        #[cfg(feature = "qdrant")]
        if let Some(mirror) = &self.mirror {
            mirror.upsert(chunks, &vectors).await?;
        }
        tx.commit().await?;

        self.catalog.record_mutation();
        self.forget_points(&stale).await;
        tracing::debug!(path = %doc.path, chunks = chunks.len(), "chunks embedded and saved");
        Ok(())
    }

    pub(crate) async fn delete_by_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<usize, StoreError> {
        let mut tx = self.catalog.pool().begin().await?;
        let removed = catalog::clear_file(&mut tx, project_id, path).await?;
        tx.commit().await?;

        if !removed.is_empty() {
            self.catalog.record_mutation();
            self.forget_points(&removed).await;
        }
        Ok(removed.len())
    }

    pub(crate) async fn delete_document(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<usize, StoreError> {
        let mut tx = self.catalog.pool().begin().await?;
        let removed = catalog::remove_document(&mut tx, project_id, path).await?;
        tx.commit().await?;

        let Some(removed) = removed else {
            return Ok(0);
        };
        self.catalog.record_mutation();
        self.forget_points(&removed).await;
        Ok(removed.len())
    }

    /// Drop mirror points for chunks that are gone from the catalog. Leftover
    /// points are harmless: hydration skips ids without a committed chunk.
    #[cfg_attr(not(feature = "qdrant"), allow(clippy::unused_async))]
    async fn forget_points(&self, ids: &[String]) {
        #[cfg(feature = "qdrant")]
        if let Some(mirror) = &self.mirror
            && let Err(e) = mirror.delete(ids).await
        {
            tracing::warn!(count = ids.len(), "failed to delete stale qdrant points: {e}");
        }
        #[cfg(not(feature = "qdrant"))]
        let _ = ids;
    }

    pub(crate) async fn search(
        &self,
        project_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let query_vector = self.embed(query).await?;
        let wanted = candidate_limit(limit);

        #[cfg(feature = "qdrant")]
        if let Some(mirror) = &self.mirror {
            match mirror.search(project_id, query_vector.clone(), wanted).await {
                Ok(scored) => {
                    let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
                    let mut conn = self.catalog.pool().acquire().await?;
                    let chunks = catalog::hydrate(&mut conn, project_id, &ids).await?;
                    return Ok(finalize(scored, chunks, &self.booster, limit));
                }
                Err(e) => {
                    tracing::warn!("qdrant search failed, falling back to exact cosine: {e}");
                }
            }
        }

        let mut tx = self.catalog.pool().begin().await?;
        let scored = exact_candidates(&mut tx, project_id, &query_vector, wanted).await?;
        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let chunks = catalog::hydrate(&mut tx, project_id, &ids).await?;
        tx.commit().await?;

        Ok(finalize(scored, chunks, &self.booster, limit))
    }
}

async fn exact_candidates(
    conn: &mut SqliteConnection,
    project_id: &str,
    query: &[f32],
    wanted: usize,
) -> Result<Vec<(String, f32)>, StoreError> {
    let rows: Vec<(String, Vec<u8>)> =
        sqlx::query_as("SELECT chunk_id, vector FROM chunk_vectors WHERE project_id = ? AND dim = ?")
            .bind(project_id)
            .bind(catalog::to_i64(query.len())?)
            .fetch_all(&mut *conn)
            .await?;

    let scored = rows
        .into_iter()
        .map(|(id, blob)| {
            let vector = decode_vector(&blob);
            (id, cosine_to_score(cosine_similarity(query, &vector)))
        })
        .collect();
    Ok(top_candidates(scored, wanted))
}

/// Vectors written by a different embedder cannot be compared. Blank the
/// hash of every document owning one so the next reconciliation re-embeds it.
async fn invalidate_foreign_dimensions(
    pool: &sqlx::SqlitePool,
    dimension: usize,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE documents SET hash = '' WHERE (project_id, path) IN (\
         SELECT c.project_id, c.file_path FROM chunks c \
         JOIN chunk_vectors v ON v.chunk_id = c.id WHERE v.dim != ?)",
    )
    .bind(catalog::to_i64(dimension)?)
    .execute(pool)
    .await?;
    if result.rows_affected() > 0 {
        tracing::warn!(
            documents = result.rows_affected(),
            dimension,
            "embedding dimension changed; affected files will be re-embedded"
        );
    }
    Ok(())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::chunk_id;
    use crate::store::EmbedderConfig;
    use chrono::Utc;

    async fn store() -> VectorStore {
        let catalog = Catalog::open(std::path::Path::new(":memory:"), 1)
            .await
            .unwrap();
        let config = StoreConfig {
            embedder: EmbedderConfig {
                dimension: 128,
                ..EmbedderConfig::default()
            },
            ..StoreConfig::default()
        };
        VectorStore::open(catalog, PathBooster::neutral(), &config)
            .await
            .unwrap()
    }

    fn file(project: &str, path: &str, bodies: &[&str]) -> (Document, Vec<Chunk>) {
        let chunks: Vec<Chunk> = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| Chunk {
                id: chunk_id(project, path, i + 1),
                project_id: project.into(),
                file_path: path.into(),
                start_line: i + 1,
                end_line: i + 1,
                content: (*body).to_string(),
                hash: String::new(),
                updated_at: Utc::now(),
            })
            .collect();
        let doc = Document {
            project_id: project.into(),
            path: path.into(),
            hash: "h".into(),
            mtime: 0,
            chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            updated_at: Utc::now(),
        };
        (doc, chunks)
    }

    #[test]
    fn vector_blob_round_trip() {
        let v = vec![0.25_f32, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }

    #[tokio::test]
    async fn exact_search_prefers_overlapping_tokens() {
        let store = store().await;
        assert_eq!(store.ranking_mode(), RankingMode::ExactCosine);
        let (doc, chunks) = file(
            "p",
            "auth.rs",
            &[
                "fn verify_session token refresh expiry",
                "render html template layout widget",
            ],
        );
        store.save_chunks(&doc, &chunks).await.unwrap();

        let results = store.search("p", "verify_session token", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.start_line, 1);
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[tokio::test]
    async fn removed_chunks_lose_their_vectors() {
        let store = store().await;
        let (doc, chunks) = file("p", "a.rs", &["alpha", "beta"]);
        store.save_chunks(&doc, &chunks).await.unwrap();
        store.delete_document("p", "a.rs").await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(store.catalog().pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(store.search("p", "alpha", 5).await.unwrap().is_empty());
    }
}
