//! Qdrant mirror of the vector table for approximate nearest-neighbour
//! search. `SQLite` stays the source of truth; hits are hydrated from it.

use std::collections::HashMap;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
    Distance, FieldType, Filter, PointId, PointStruct, PointsIdsList, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder, point_id::PointIdOptions,
};

use super::StoreError;
use super::embed::cosine_to_score;
use crate::types::Chunk;

const COLLECTION_PREFIX: &str = "sift_chunks";

pub(crate) struct QdrantMirror {
    client: Qdrant,
    collection: String,
}

impl std::fmt::Debug for QdrantMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantMirror")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl QdrantMirror {
    /// Connect and make sure a cosine collection of `dimension` exists.
    /// The collection name carries the dimension so a model change never
    /// writes into an incompatible collection.
    pub(crate) async fn connect(url: &str, dimension: usize) -> Result<Self, StoreError> {
        let client = Qdrant::from_url(url).build()?;
        let collection = format!("{COLLECTION_PREFIX}_{dimension}");

        if !client.collection_exists(&collection).await? {
            let size = u64::try_from(dimension)
                .map_err(|_| StoreError::Invalid(format!("dimension {dimension} too large")))?;
            client
                .create_collection(
                    CreateCollectionBuilder::new(&collection)
                        .vectors_config(VectorParamsBuilder::new(size, Distance::Cosine)),
                )
                .await?;
            client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &collection,
                    "project_id",
                    FieldType::Keyword,
                ))
                .await?;
            tracing::info!(%collection, "created qdrant collection");
        }

        Ok(Self { client, collection })
    }

    pub(crate) async fn upsert(
        &self,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut points = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors) {
            let payload: HashMap<String, qdrant_client::qdrant::Value> =
                serde_json::from_value(serde_json::json!({
                    "project_id": chunk.project_id,
                    "file_path": chunk.file_path,
                    "start_line": chunk.start_line,
                    "end_line": chunk.end_line,
                }))
                .map_err(|e| StoreError::Qdrant(format!("payload conversion: {e}")))?;
            points.push(PointStruct::new(chunk.id.clone(), vector.clone(), payload));
        }
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.clone())).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    /// Nearest chunks within one project, scored on the `[0, 1]` scale.
    pub(crate) async fn search(
        &self,
        project_id: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<(String, f32)>, StoreError> {
        let limit = u64::try_from(limit).unwrap_or(u64::MAX);
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector, limit)
                    .filter(Filter::must(vec![Condition::matches(
                        "project_id",
                        project_id.to_string(),
                    )]))
                    .with_payload(false),
            )
            .await?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = match point.id.and_then(|pid| pid.point_id_options)? {
                    PointIdOptions::Uuid(u) => u,
                    PointIdOptions::Num(n) => n.to_string(),
                };
                Some((id, cosine_to_score(point.score)))
            })
            .collect())
    }
}
