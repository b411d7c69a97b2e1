//! Reconciliation engine: scan → hash → chunk → store.
//!
//! Each file is classified by comparing a fresh content hash with the stored
//! document: unseen files are added, changed files have their chunk set
//! replaced atomically, unchanged files cause no store mutation, and files
//! that vanished or became ignored are removed with all their chunks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, UNIX_EPOCH};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunker::{ChunkerConfig, chunk_id, chunk_text, content_hash};
use crate::error::{IndexError, Result};
use crate::scanner::Scanner;
use crate::store::{AnyStore, StoreError};
use crate::types::{Chunk, Document};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub project_id: String,
    pub chunker: ChunkerConfig,
    /// Files handed to one concurrent batch (default: 64).
    pub batch_size: usize,
    /// Files processed at once within a batch (default: 4).
    pub concurrency: usize,
    /// Upper bound for every store call (default: 30 s).
    pub store_timeout: Duration,
}

impl IndexerConfig {
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            chunker: ChunkerConfig::default(),
            batch_size: 64,
            concurrency: 4,
            store_timeout: Duration::from_secs(30),
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty project id, an invalid chunker
    /// configuration, or zero batch size or concurrency.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(IndexError::InvalidConfig("project id must not be empty".into()));
        }
        if self.batch_size == 0 || self.concurrency == 0 {
            return Err(IndexError::InvalidConfig(
                "batch_size and concurrency must be > 0".into(),
            ));
        }
        self.chunker.validate()
    }
}

/// Summary of a reconciliation run.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_added: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub chunks_written: usize,
    pub chunks_removed: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl IndexReport {
    /// Files whose stored state changed.
    #[must_use]
    pub fn files_changed(&self) -> usize {
        self.files_added + self.files_updated + self.files_removed
    }

    fn record(&mut self, path: &str, outcome: &Result<FileOutcome>) {
        match outcome {
            Ok(FileOutcome::Added { chunks }) => {
                self.files_added += 1;
                self.chunks_written += chunks;
            }
            Ok(FileOutcome::Updated { chunks, removed }) => {
                self.files_updated += 1;
                self.chunks_written += chunks;
                self.chunks_removed += removed;
            }
            Ok(FileOutcome::Unchanged) => self.files_unchanged += 1,
            Ok(FileOutcome::Removed { chunks }) => {
                self.files_removed += 1;
                self.chunks_removed += chunks;
            }
            Ok(FileOutcome::Skipped) => {}
            Err(e) => {
                tracing::warn!(path, "reconcile failed: {e}");
                self.files_failed += 1;
                self.errors.push(format!("{path}: {e}"));
            }
        }
    }

    fn finish(&mut self, start: Instant) {
        self.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    }
}

/// What reconciling one path did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Added { chunks: usize },
    Updated { chunks: usize, removed: usize },
    Unchanged,
    Removed { chunks: usize },
    /// Not indexed before and not eligible now.
    Skipped,
}

/// One async mutex per path, shared by full passes and watcher triggers.
#[derive(Debug, Default)]
struct PathLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    fn lock_for(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(path.to_string()).or_default())
    }

    /// Drop entries nobody is holding or waiting on.
    fn prune(&self) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Sole writer of one project's documents and chunks.
#[derive(Debug)]
pub struct Indexer {
    store: Arc<AnyStore>,
    scanner: Scanner,
    config: IndexerConfig,
    locks: PathLocks,
}

impl Indexer {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(store: Arc<AnyStore>, scanner: Scanner, config: IndexerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            scanner,
            config,
            locks: PathLocks::default(),
        })
    }

    #[must_use]
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AnyStore> {
        &self.store
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    /// Bring the whole project in line with the filesystem.
    ///
    /// Per-file failures are recorded in the report and do not stop the
    /// pass. Cancellation is honoured between batches and yields a partial
    /// report with `cancelled` set.
    ///
    /// # Errors
    ///
    /// Returns an error when storage becomes unreachable, or if the
    /// background walk panics.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> Result<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport::default();
        let batch_size = self.config.batch_size;

        let (tx, mut rx) = mpsc::channel(batch_size.saturating_mul(2));
        let scanner = self.scanner.clone();
        let walker = tokio::task::spawn_blocking(move || {
            for path in scanner.walk() {
                if tx.blocking_send(path).is_err() {
                    break;
                }
            }
        });

        let mut seen: HashSet<String> = HashSet::new();
        let mut fatal = None;
        let mut batch = Vec::with_capacity(batch_size);
        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            batch.clear();
            if rx.recv_many(&mut batch, batch_size).await == 0 {
                break;
            }

            let paths: Vec<String> = batch
                .iter()
                .filter_map(|p| self.scanner.relative_path(p))
                .collect();
            report.files_scanned += paths.len();
            seen.extend(paths.iter().cloned());

            let outcomes: Vec<(String, Result<FileOutcome>)> = futures::stream::iter(paths)
                .map(|path| async move {
                    let outcome = self.reconcile_file(&path, true).await;
                    (path, outcome)
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;
            for (path, outcome) in outcomes {
                report.record(&path, &outcome);
                if let Err(e) = outcome
                    && e.is_connectivity()
                {
                    fatal = Some(e);
                }
            }
            if fatal.is_some() {
                break;
            }

            // Let searches and watcher flushes run between batches.
            tokio::task::yield_now().await;
        }
        drop(rx);
        walker.await?;

        if let Some(e) = fatal {
            return Err(e);
        }

        if !report.cancelled {
            let stored = self
                .bounded(self.store.list_documents(&self.config.project_id))
                .await?;
            for path in stored.into_iter().filter(|p| !seen.contains(p)) {
                let outcome = self.reconcile_file(&path, false).await;
                if let Err(e) = &outcome
                    && e.is_connectivity()
                {
                    return Err(outcome.err().unwrap_or(IndexError::Other(path)));
                }
                report.record(&path, &outcome);
            }
            self.locks.prune();
        }

        report.finish(start);
        tracing::info!(
            scanned = report.files_scanned,
            added = report.files_added,
            updated = report.files_updated,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            failed = report.files_failed,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Reconcile one filesystem path reported by the watcher.
    ///
    /// A directory path covers every document beneath it, so a vanished
    /// directory removes all of its files and a new one is indexed in full.
    ///
    /// # Errors
    ///
    /// Returns an error when storage becomes unreachable.
    pub async fn reconcile_path(&self, path: &Path) -> Result<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport::default();
        let Some(rel) = self.scanner.relative_path(path) else {
            return Ok(report);
        };

        let is_dir = tokio::fs::symlink_metadata(path)
            .await
            .is_ok_and(|m| m.is_dir());
        let mut targets = BTreeSet::new();
        if is_dir {
            let scanner = self.scanner.clone();
            let dir = path.to_path_buf();
            let found: Vec<String> = tokio::task::spawn_blocking(move || {
                scanner
                    .walk()
                    .filter(|p| p.starts_with(&dir))
                    .filter_map(|p| scanner.relative_path(&p))
                    .collect()
            })
            .await?;
            targets.extend(found);
        } else {
            targets.insert(rel.clone());
        }
        let prefix = format!("{rel}/");
        let stored = self
            .bounded(self.store.list_documents(&self.config.project_id))
            .await?;
        targets.extend(stored.into_iter().filter(|p| p.starts_with(&prefix)));

        for target in targets {
            report.files_scanned += 1;
            let outcome = self.reconcile_file(&target, false).await;
            if let Err(e) = &outcome
                && e.is_connectivity()
            {
                self.locks.prune();
                return Err(outcome.err().unwrap_or(IndexError::Other(target)));
            }
            report.record(&target, &outcome);
        }
        self.locks.prune();
        report.finish(start);
        Ok(report)
    }

    /// True when a document exists at `rel` or beneath it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn is_tracked(&self, rel: &str) -> Result<bool> {
        let project = self.config.project_id.as_str();
        if self.bounded(self.store.get_document(project, rel)).await?.is_some() {
            return Ok(true);
        }
        let prefix = format!("{rel}/");
        let stored = self.bounded(self.store.list_documents(project)).await?;
        Ok(stored.iter().any(|p| p.starts_with(&prefix)))
    }

    /// Converge one stored path with the filesystem. `walked` means the
    /// scanner already judged the file eligible.
    async fn reconcile_file(&self, rel: &str, walked: bool) -> Result<FileOutcome> {
        let lock = self.locks.lock_for(rel);
        let _guard = lock.lock().await;

        let project = self.config.project_id.as_str();
        let abs = self.scanner.absolute_path(rel);
        let stored = self.bounded(self.store.get_document(project, rel)).await?;

        let eligible = walked || {
            let scanner = self.scanner.clone();
            let abs = abs.clone();
            tokio::task::spawn_blocking(move || scanner.is_eligible(&abs)).await?
        };
        if !eligible {
            return self.remove(rel, stored.as_ref()).await;
        }

        let bytes = match tokio::fs::read(&abs).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.remove(rel, stored.as_ref()).await;
            }
            Err(e) => return Err(e.into()),
        };
        let hash = content_hash(&bytes);
        if stored.as_ref().is_some_and(|doc| doc.hash == hash) {
            tracing::trace!(path = rel, "unchanged");
            return Ok(FileOutcome::Unchanged);
        }
        let text = String::from_utf8(bytes).map_err(|e| IndexError::Decode {
            path: abs.clone(),
            reason: e.utf8_error().to_string(),
        })?;
        let mtime = tokio::fs::metadata(&abs)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_secs()).ok())
            .unwrap_or(0);

        let now = Utc::now();
        let chunks: Vec<Chunk> = chunk_text(&text, &self.config.chunker)
            .into_iter()
            .map(|c| Chunk {
                id: chunk_id(project, rel, c.start_line),
                project_id: project.to_string(),
                file_path: rel.to_string(),
                start_line: c.start_line,
                end_line: c.end_line,
                content: c.content,
                hash: c.content_hash,
                updated_at: now,
            })
            .collect();
        let doc = Document {
            project_id: project.to_string(),
            path: rel.to_string(),
            hash,
            mtime,
            chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            updated_at: now,
        };
        self.bounded(self.store.save_chunks(&doc, &chunks)).await?;

        let written = chunks.len();
        match stored {
            None => {
                tracing::debug!(path = rel, chunks = written, "added");
                Ok(FileOutcome::Added { chunks: written })
            }
            Some(previous) => {
                let kept: HashSet<&str> = doc.chunk_ids.iter().map(String::as_str).collect();
                let removed = previous
                    .chunk_ids
                    .iter()
                    .filter(|id| !kept.contains(id.as_str()))
                    .count();
                tracing::debug!(path = rel, chunks = written, removed, "updated");
                Ok(FileOutcome::Updated {
                    chunks: written,
                    removed,
                })
            }
        }
    }

    async fn remove(&self, rel: &str, stored: Option<&Document>) -> Result<FileOutcome> {
        if stored.is_none() {
            return Ok(FileOutcome::Skipped);
        }
        let chunks = self
            .bounded(self.store.delete_document(&self.config.project_id, rel))
            .await?;
        tracing::debug!(path = rel, chunks, "removed");
        Ok(FileOutcome::Removed { chunks })
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.store_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout).into()),
        }
    }
}
