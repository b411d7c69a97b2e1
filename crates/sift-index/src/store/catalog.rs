//! `SQLite` catalog shared by both backends: documents, chunks, and the rule
//! that a document's chunk-id list always equals its stored chunk set.
//!
//! Writers compose the free functions below inside one transaction; readers
//! go through [`Catalog`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::StoreError;
use super::tokenize;
use crate::types::{Chunk, Document, StoreStats};

/// Upper bound on bind parameters per `IN (...)` list.
const IN_BATCH: usize = 500;

const CHUNK_COLUMNS: &str =
    "id, project_id, file_path, start_line, end_line, content, hash, updated_at";

type ChunkRow = (String, String, String, i64, i64, String, String, i64);
type DocumentRow = (String, String, String, i64, String, i64);

#[derive(Debug)]
pub(crate) struct Catalog {
    pool: SqlitePool,
    mutations: AtomicU64,
}

impl Catalog {
    /// Open (or create) the catalog database and run migrations.
    ///
    /// Foreign keys are enabled per connection so that removing a document
    /// cascades to its chunks, terms and vectors.
    pub(crate) async fn open(path: &Path, pool_size: u32) -> Result<Self, StoreError> {
        let in_memory = path.as_os_str() == ":memory:";
        let base = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Connection(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            SqliteConnectOptions::new().filename(path)
        };
        let opts = base
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A private in-memory database lives and dies with its one connection.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(pool_size.max(1))
        };
        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!().run(&pool).await?;
        tracing::debug!(path = %path.display(), "catalog ready");

        Ok(Self {
            pool,
            mutations: AtomicU64::new(0),
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) async fn get_document(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT project_id, path, hash, mtime, chunk_ids, updated_at \
             FROM documents WHERE project_id = ? AND path = ?",
        )
        .bind(project_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(document_from_row).transpose()
    }

    pub(crate) async fn list_documents(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM documents WHERE project_id = ? ORDER BY path")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    pub(crate) async fn get_stats(&self, project_id: &str) -> Result<StoreStats, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (files, last): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), MAX(updated_at) FROM documents WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&mut *tx)
                .await?;
        let (chunks,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoreStats {
            total_files: to_usize(files),
            total_chunks: to_usize(chunks),
            last_updated: last.map(from_millis),
        })
    }

    pub(crate) async fn get_all_chunks(&self, project_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ? \
             ORDER BY file_path, start_line"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(chunk_from_row).collect())
    }

    pub(crate) async fn get_chunks_for_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ? AND file_path = ? \
             ORDER BY start_line"
        ))
        .bind(project_id)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(chunk_from_row).collect())
    }
}

/// Reject a write whose document does not describe exactly the supplied
/// chunk set.
pub(crate) fn validate_chunk_set(doc: &Document, chunks: &[Chunk]) -> Result<(), StoreError> {
    let mut supplied = HashSet::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.project_id != doc.project_id || chunk.file_path != doc.path {
            return Err(StoreError::Invalid(format!(
                "chunk {} belongs to {}:{}, not {}:{}",
                chunk.id, chunk.project_id, chunk.file_path, doc.project_id, doc.path
            )));
        }
        if !supplied.insert(chunk.id.as_str()) {
            return Err(StoreError::Invalid(format!("duplicate chunk id {}", chunk.id)));
        }
    }
    let listed: HashSet<&str> = doc.chunk_ids.iter().map(String::as_str).collect();
    if listed.len() != doc.chunk_ids.len() || listed != supplied {
        return Err(StoreError::Invalid(format!(
            "document {} lists {} chunk ids but {} chunks were supplied",
            doc.path,
            doc.chunk_ids.len(),
            chunks.len()
        )));
    }
    Ok(())
}

pub(crate) async fn upsert_document(
    conn: &mut SqliteConnection,
    doc: &Document,
) -> Result<(), StoreError> {
    let chunk_ids = serde_json::to_string(&doc.chunk_ids)?;
    sqlx::query(
        "INSERT INTO documents (project_id, path, hash, mtime, chunk_ids, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (project_id, path) DO UPDATE SET \
         hash = excluded.hash, mtime = excluded.mtime, \
         chunk_ids = excluded.chunk_ids, updated_at = excluded.updated_at",
    )
    .bind(&doc.project_id)
    .bind(&doc.path)
    .bind(&doc.hash)
    .bind(doc.mtime)
    .bind(chunk_ids)
    .bind(doc.updated_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Upsert the document and make its stored chunk set equal `chunks`.
///
/// Returns the ids of chunks that were removed.
pub(crate) async fn replace_chunks(
    conn: &mut SqliteConnection,
    doc: &Document,
    chunks: &[Chunk],
) -> Result<Vec<String>, StoreError> {
    upsert_document(conn, doc).await?;

    let keep: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    let stale: Vec<String> = file_chunk_ids(conn, &doc.project_id, &doc.path)
        .await?
        .into_iter()
        .filter(|id| !keep.contains(id.as_str()))
        .collect();
    delete_chunks_by_id(conn, &stale).await?;

    for chunk in chunks {
        let token_count = to_i64(tokenize::tokenize(&chunk.content).len())?;
        sqlx::query(
            "INSERT INTO chunks \
             (id, project_id, file_path, start_line, end_line, content, hash, token_count, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
             start_line = excluded.start_line, end_line = excluded.end_line, \
             content = excluded.content, hash = excluded.hash, \
             token_count = excluded.token_count, updated_at = excluded.updated_at",
        )
        .bind(&chunk.id)
        .bind(&chunk.project_id)
        .bind(&chunk.file_path)
        .bind(to_i64(chunk.start_line)?)
        .bind(to_i64(chunk.end_line)?)
        .bind(&chunk.content)
        .bind(&chunk.hash)
        .bind(token_count)
        .bind(chunk.updated_at.timestamp_millis())
        .execute(&mut *conn)
        .await?;
    }

    Ok(stale)
}

/// Drop every chunk of a file but keep its document with an empty hash,
/// so the next reconciliation sees it as changed.
///
/// Returns the removed chunk ids.
pub(crate) async fn clear_file(
    conn: &mut SqliteConnection,
    project_id: &str,
    path: &str,
) -> Result<Vec<String>, StoreError> {
    let removed = file_chunk_ids(conn, project_id, path).await?;
    sqlx::query("DELETE FROM chunks WHERE project_id = ? AND file_path = ?")
        .bind(project_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "UPDATE documents SET hash = '', chunk_ids = '[]', updated_at = ? \
         WHERE project_id = ? AND path = ?",
    )
    .bind(Utc::now().timestamp_millis())
    .bind(project_id)
    .bind(path)
    .execute(&mut *conn)
    .await?;
    Ok(removed)
}

/// Delete a document; its chunks go with it through the cascade.
///
/// Returns `None` when no such document existed.
pub(crate) async fn remove_document(
    conn: &mut SqliteConnection,
    project_id: &str,
    path: &str,
) -> Result<Option<Vec<String>>, StoreError> {
    let removed = file_chunk_ids(conn, project_id, path).await?;
    let result = sqlx::query("DELETE FROM documents WHERE project_id = ? AND path = ?")
        .bind(project_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(removed))
}

/// Update document metadata only. The listed chunk ids must match what is
/// already stored for the path.
pub(crate) async fn update_document_checked(
    conn: &mut SqliteConnection,
    doc: &Document,
) -> Result<(), StoreError> {
    let stored: HashSet<String> = file_chunk_ids(conn, &doc.project_id, &doc.path)
        .await?
        .into_iter()
        .collect();
    let listed: HashSet<String> = doc.chunk_ids.iter().cloned().collect();
    if stored != listed || listed.len() != doc.chunk_ids.len() {
        return Err(StoreError::Invalid(format!(
            "document {} chunk ids do not match the stored chunk set; use save_chunks",
            doc.path
        )));
    }
    upsert_document(conn, doc).await
}

pub(crate) async fn file_chunk_ids(
    conn: &mut SqliteConnection,
    project_id: &str,
    path: &str,
) -> Result<Vec<String>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM chunks WHERE project_id = ? AND file_path = ?")
            .bind(project_id)
            .bind(path)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

async fn delete_chunks_by_id(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<(), StoreError> {
    for batch in ids.chunks(IN_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM chunks WHERE id IN (");
        let mut list = qb.separated(", ");
        for id in batch {
            list.push_bind(id.as_str());
        }
        list.push_unseparated(")");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Load committed chunks by id, scoped to one project. Ids that are not
/// present are silently absent from the map.
pub(crate) async fn hydrate(
    conn: &mut SqliteConnection,
    project_id: &str,
    ids: &[String],
) -> Result<HashMap<String, Chunk>, StoreError> {
    let mut found = HashMap::with_capacity(ids.len());
    for batch in ids.chunks(IN_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = "
        ));
        qb.push_bind(project_id);
        qb.push(" AND id IN (");
        let mut list = qb.separated(", ");
        for id in batch {
            list.push_bind(id.as_str());
        }
        list.push_unseparated(")");
        let rows: Vec<ChunkRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for row in rows {
            let chunk = chunk_from_row(row);
            found.insert(chunk.id.clone(), chunk);
        }
    }
    Ok(found)
}

pub(crate) fn to_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("{value} out of range")))
}

pub(crate) fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn chunk_from_row(row: ChunkRow) -> Chunk {
    let (id, project_id, file_path, start_line, end_line, content, hash, updated_at) = row;
    Chunk {
        id,
        project_id,
        file_path,
        start_line: to_usize(start_line),
        end_line: to_usize(end_line),
        content,
        hash,
        updated_at: from_millis(updated_at),
    }
}

fn document_from_row(row: DocumentRow) -> Result<Document, StoreError> {
    let (project_id, path, hash, mtime, chunk_ids, updated_at) = row;
    Ok(Document {
        project_id,
        path,
        hash,
        mtime,
        chunk_ids: serde_json::from_str(&chunk_ids)?,
        updated_at: from_millis(updated_at),
    })
}
