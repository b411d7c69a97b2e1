//! Lexical backend: BM25 through FTS5, or a built-in Okapi BM25 over the
//! `chunk_terms` inverted index when FTS5 is unavailable or disabled.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::catalog::{self, Catalog};
use super::tokenize;
use super::{PathBooster, RankingMode, StoreError, candidate_limit, finalize, top_candidates};
use crate::types::{Chunk, Document, SearchResult};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Query terms beyond this are ignored.
const MAX_QUERY_TERMS: usize = 64;

/// Rows per multi-row `INSERT` into `chunk_terms` (four binds each).
const TERM_INSERT_BATCH: usize = 200;

/// Prefix of the per-project FTS5 tables. Each project gets its own table
/// so BM25 document statistics never mix projects.
const FTS_PREFIX: &str = "chunks_fts_";

/// Rowids per `DELETE ... WHERE rowid IN (...)`.
const ROWID_BATCH: usize = 500;

#[derive(Debug)]
pub struct LexicalStore {
    catalog: Catalog,
    booster: PathBooster,
    fts: bool,
    /// FTS tables created and synced by this process.
    fts_ready: Mutex<HashSet<String>>,
}

impl LexicalStore {
    pub(crate) async fn open(catalog: Catalog, booster: PathBooster, accelerated: bool) -> Self {
        let fts = if accelerated {
            fts5_available(catalog.pool()).await
        } else {
            if let Err(e) = drop_fts_tables(catalog.pool()).await {
                tracing::debug!("could not drop stale full-text tables: {e}");
            }
            false
        };
        Self {
            catalog,
            booster,
            fts,
            fts_ready: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn ranking_mode(&self) -> RankingMode {
        if self.fts {
            RankingMode::Fts5Bm25
        } else {
            RankingMode::BuiltinBm25
        }
    }

    pub(crate) async fn save_chunks(
        &self,
        doc: &Document,
        chunks: &[Chunk],
    ) -> Result<(), StoreError> {
        catalog::validate_chunk_set(doc, chunks)?;
        let table = self.fts_table(&doc.project_id).await?;

        let mut tx = self.catalog.pool().begin().await?;
        let previous = match &table {
            Some(_) => file_rowids(&mut tx, &doc.project_id, &doc.path).await?,
            None => Vec::new(),
        };
        catalog::replace_chunks(&mut tx, doc, chunks).await?;
        write_terms(&mut tx, chunks).await?;
        if let Some(table) = &table {
            delete_fts_rows(&mut tx, table, &previous).await?;
            insert_fts_rows(&mut tx, table, &doc.project_id, &doc.path).await?;
        }
        tx.commit().await?;

        self.catalog.record_mutation();
        tracing::debug!(path = %doc.path, chunks = chunks.len(), "chunks saved");
        Ok(())
    }

    pub(crate) async fn delete_by_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<usize, StoreError> {
        let table = self.fts_table(project_id).await?;

        let mut tx = self.catalog.pool().begin().await?;
        let rowids = file_rowids(&mut tx, project_id, path).await?;
        let removed = catalog::clear_file(&mut tx, project_id, path).await?;
        if let Some(table) = &table {
            delete_fts_rows(&mut tx, table, &rowids).await?;
        }
        tx.commit().await?;

        if !removed.is_empty() {
            self.catalog.record_mutation();
        }
        Ok(removed.len())
    }

    pub(crate) async fn delete_document(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<usize, StoreError> {
        let table = self.fts_table(project_id).await?;

        let mut tx = self.catalog.pool().begin().await?;
        let rowids = file_rowids(&mut tx, project_id, path).await?;
        let removed = catalog::remove_document(&mut tx, project_id, path).await?;
        if let Some(table) = &table {
            delete_fts_rows(&mut tx, table, &rowids).await?;
        }
        tx.commit().await?;

        Ok(removed.map_or(0, |ids| {
            self.catalog.record_mutation();
            ids.len()
        }))
    }

    pub(crate) async fn search(
        &self,
        project_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let mut terms = tokenize::query_terms(query);
        terms.truncate(MAX_QUERY_TERMS);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let wanted = candidate_limit(limit);
        let table = self.fts_table(project_id).await?;

        // One read transaction: scores and hydrated rows see the same snapshot.
        let mut tx = self.catalog.pool().begin().await?;
        let scored = match &table {
            Some(table) => fts5_candidates(&mut tx, table, &terms, wanted).await?,
            None => bm25_candidates(&mut tx, project_id, &terms, wanted).await?,
        };
        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let chunks = catalog::hydrate(&mut tx, project_id, &ids).await?;
        tx.commit().await?;

        Ok(finalize(scored, chunks, &self.booster, limit))
    }

    /// The project's FTS table, created and brought in line with `chunks`
    /// on first use. `None` in built-in mode.
    async fn fts_table(&self, project_id: &str) -> Result<Option<String>, StoreError> {
        if !self.fts {
            return Ok(None);
        }
        let table = fts_table_name(project_id);
        if self.ready().contains(&table) {
            return Ok(Some(table));
        }

        let mut tx = self.catalog.pool().begin().await?;
        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {table} USING fts5(\
             content, chunk_id UNINDEXED, tokenize = \"unicode61 tokenchars '_'\")"
        ))
        .execute(&mut *tx)
        .await?;
        sync_fts(&mut tx, &table, project_id).await?;
        tx.commit().await?;

        self.ready().insert(table.clone());
        Ok(Some(table))
    }

    fn ready(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.fts_ready.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fts_table_name(project_id: &str) -> String {
    let digest = blake3::hash(project_id.as_bytes()).to_hex();
    format!("{FTS_PREFIX}{}", &digest[..16])
}

/// Whether this SQLite build ships the FTS5 module.
async fn fts5_available(pool: &SqlitePool) -> bool {
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("FTS5 check failed, falling back to built-in BM25: {e}");
            return false;
        }
    };
    let created = sqlx::query("CREATE VIRTUAL TABLE IF NOT EXISTS temp.fts5_check USING fts5(x)")
        .execute(&mut *conn)
        .await;
    if let Err(e) = created {
        tracing::warn!("FTS5 unavailable, falling back to built-in BM25: {e}");
        return false;
    }
    if let Err(e) = sqlx::query("DROP TABLE IF EXISTS temp.fts5_check")
        .execute(&mut *conn)
        .await
    {
        tracing::debug!("could not drop FTS5 check table: {e}");
    }
    true
}

/// Drop every per-project FTS table, and the older shared one.
async fn drop_fts_tables(pool: &SqlitePool) -> Result<(), StoreError> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND (name = 'chunks_fts' OR name GLOB 'chunks_fts_[0-9a-f]*') \
         AND sql LIKE 'CREATE VIRTUAL TABLE%'",
    )
    .fetch_all(pool)
    .await?;
    for (table,) in tables {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Rebuild the table from `chunks` when its row count disagrees.
async fn sync_fts(
    conn: &mut SqliteConnection,
    table: &str,
    project_id: &str,
) -> Result<(), StoreError> {
    let (indexed,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(&mut *conn)
        .await?;
    let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(&mut *conn)
        .await?;
    if indexed != stored {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO {table} (rowid, content, chunk_id) \
             SELECT rowid, content, id FROM chunks WHERE project_id = ?"
        ))
        .bind(project_id)
        .execute(&mut *conn)
        .await?;
        tracing::info!(%table, rows = stored, "rebuilt full-text index");
    }
    Ok(())
}

/// Rowids of a file's stored chunks; FTS rows share them.
async fn file_rowids(
    conn: &mut SqliteConnection,
    project_id: &str,
    path: &str,
) -> Result<Vec<i64>, StoreError> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT rowid FROM chunks WHERE project_id = ? AND file_path = ?")
            .bind(project_id)
            .bind(path)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(rowid,)| rowid).collect())
}

async fn delete_fts_rows(
    conn: &mut SqliteConnection,
    table: &str,
    rowids: &[i64],
) -> Result<(), StoreError> {
    for batch in rowids.chunks(ROWID_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE rowid IN ("));
        let mut list = qb.separated(", ");
        for rowid in batch {
            list.push_bind(*rowid);
        }
        list.push_unseparated(")");
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_fts_rows(
    conn: &mut SqliteConnection,
    table: &str,
    project_id: &str,
    path: &str,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {table} (rowid, content, chunk_id) \
         SELECT rowid, content, id FROM chunks WHERE project_id = ? AND file_path = ?"
    ))
    .bind(project_id)
    .bind(path)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_terms(conn: &mut SqliteConnection, chunks: &[Chunk]) -> Result<(), StoreError> {
    for chunk in chunks {
        sqlx::query("DELETE FROM chunk_terms WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut *conn)
            .await?;

        let postings: Vec<(String, u32)> = tokenize::term_frequencies(&chunk.content)
            .into_iter()
            .collect();
        for batch in postings.chunks(TERM_INSERT_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO chunk_terms (chunk_id, project_id, term, tf) ",
            );
            qb.push_values(batch, |mut row, (term, tf)| {
                row.push_bind(chunk.id.as_str())
                    .push_bind(chunk.project_id.as_str())
                    .push_bind(term.as_str())
                    .push_bind(i64::from(*tf));
            });
            qb.build().execute(&mut *conn).await?;
        }
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
async fn fts5_candidates(
    conn: &mut SqliteConnection,
    table: &str,
    terms: &[String],
    wanted: usize,
) -> Result<Vec<(String, f32)>, StoreError> {
    let rows: Vec<(String, f64)> = sqlx::query_as(&format!(
        "SELECT chunk_id, -bm25({table}) AS score FROM {table} \
         WHERE {table} MATCH ? ORDER BY score DESC, chunk_id LIMIT ?"
    ))
    .bind(tokenize::fts5_match_expression(terms))
    .bind(catalog::to_i64(wanted).unwrap_or(i64::MAX))
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, score)| (id, score.max(0.0) as f32))
        .collect())
}

/// Okapi BM25 with `idf = ln(1 + (N - df + 0.5) / (df + 0.5))`, which is
/// always positive.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
async fn bm25_candidates(
    conn: &mut SqliteConnection,
    project_id: &str,
    terms: &[String],
    wanted: usize,
) -> Result<Vec<(String, f32)>, StoreError> {
    let (total, avg_len): (i64, Option<f64>) =
        sqlx::query_as("SELECT COUNT(*), AVG(token_count) FROM chunks WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&mut *conn)
            .await?;
    if total == 0 {
        return Ok(Vec::new());
    }
    let n = total as f64;
    let avg_len = avg_len.unwrap_or(1.0).max(1.0);

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT term, COUNT(*) FROM chunk_terms WHERE project_id = ",
    );
    qb.push_bind(project_id);
    push_term_list(&mut qb, terms);
    qb.push(" GROUP BY term");
    let frequencies: Vec<(String, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
    let idf: HashMap<String, f64> = frequencies
        .into_iter()
        .map(|(term, df)| {
            let df = df as f64;
            (term, (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
        })
        .collect();
    if idf.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT t.chunk_id, t.term, t.tf, c.token_count FROM chunk_terms t \
         JOIN chunks c ON c.id = t.chunk_id WHERE t.project_id = ",
    );
    qb.push_bind(project_id);
    push_term_list(&mut qb, terms);
    let postings: Vec<(String, String, i64, i64)> =
        qb.build_query_as().fetch_all(&mut *conn).await?;

    let mut scores: HashMap<String, f64> = HashMap::new();
    for (chunk_id, term, tf, doc_len) in postings {
        let Some(term_idf) = idf.get(&term) else {
            continue;
        };
        let tf = tf as f64;
        let norm = 1.0 - BM25_B + BM25_B * (doc_len as f64 / avg_len);
        let weight = term_idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * norm);
        *scores.entry(chunk_id).or_insert(0.0) += weight;
    }

    let scored = scores
        .into_iter()
        .map(|(id, score)| (id, score as f32))
        .collect();
    Ok(top_candidates(scored, wanted))
}

fn push_term_list<'a>(qb: &mut QueryBuilder<'a, Sqlite>, terms: &'a [String]) {
    qb.push(" AND term IN (");
    let mut list = qb.separated(", ");
    for term in terms {
        list.push_bind(term.as_str());
    }
    list.push_unseparated(")");
}
