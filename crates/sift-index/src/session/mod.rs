//! Session coordinator: one watcher and store owner per project.
//!
//! [`Session::start`] takes the project's lock, opens the store, starts the
//! watcher and launches the initial full reconciliation in the background.
//! A second start while a live owner holds the lock is a no-op that reports
//! the owner's PID.

pub mod lock;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

pub use lock::{
    Acquire, LOCK_FILE, SessionLock, StopOutcome, is_alive, is_held, read_owner, stop_owner,
};

use crate::error::{IndexError, Result};
use crate::indexer::{IndexReport, Indexer, IndexerConfig};
use crate::scanner::{Scanner, ScannerConfig};
use crate::store::{AnyStore, RankingMode, StoreConfig};
use crate::types::{SearchResult, StoreStats};
use crate::watcher::{IndexWatcher, WatchStats, WatcherConfig};

/// Everything needed to run one project.
///
/// Relative `state_dir` and `store.sqlite_path` are resolved against the
/// canonical `root`. An empty `indexer.project_id` is derived from the root.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub scanner: ScannerConfig,
    pub indexer: IndexerConfig,
    pub store: StoreConfig,
    /// `None` disables live watching; only explicit passes update the index.
    pub watch: Option<WatcherConfig>,
}

impl SessionSettings {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state_dir: PathBuf::from(".sift"),
            scanner: ScannerConfig::default(),
            indexer: IndexerConfig::new(""),
            store: StoreConfig::default(),
            watch: Some(WatcherConfig::default()),
        }
    }

    /// Canonical root plus absolute state directory and database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the root does not exist.
    pub fn resolve_paths(&self) -> Result<ResolvedPaths> {
        let root = self.root.canonicalize()?;
        let state_dir = absolutize(&root, &self.state_dir);
        let sqlite_path = if self.store.sqlite_path.as_os_str() == ":memory:" {
            self.store.sqlite_path.clone()
        } else {
            absolutize(&root, &self.store.sqlite_path)
        };
        let project_id = if self.indexer.project_id.trim().is_empty() {
            derive_project_id(&root)
        } else {
            self.indexer.project_id.clone()
        };
        Ok(ResolvedPaths {
            lock_file: state_dir.join(LOCK_FILE),
            root,
            state_dir,
            sqlite_path,
            project_id,
        })
    }
}

/// Output of [`SessionSettings::resolve_paths`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub lock_file: PathBuf,
    pub sqlite_path: PathBuf,
    pub project_id: String,
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Stable project id for a canonical root: first 16 hex digits of its blake3.
#[must_use]
pub fn derive_project_id(root: &Path) -> String {
    let digest = blake3::hash(root.to_string_lossy().as_bytes()).to_hex();
    digest[..16].to_string()
}

#[derive(Debug)]
pub enum StartOutcome {
    Started(Session),
    AlreadyRunning { pid: u32 },
}

/// Summary returned by [`Session::stop`].
#[derive(Debug, Clone, Default)]
pub struct StopSummary {
    pub initial_pass: Option<IndexReport>,
    pub watch: Option<WatchStats>,
}

/// A running project: lock, store, indexer, watcher and background tasks.
pub struct Session {
    paths: ResolvedPaths,
    store: Arc<AnyStore>,
    indexer: Arc<Indexer>,
    watcher: Option<IndexWatcher>,
    initial_pass: Option<JoinHandle<Result<IndexReport>>>,
    cancel: CancellationToken,
    lock: SessionLock,
    _cancel_on_drop: DropGuard,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("project_id", &self.paths.project_id)
            .field("root", &self.paths.root)
            .field("watching", &self.watcher.is_some())
            .field("pid", &self.lock.pid())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Take ownership of the project and start indexing.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, the lock cannot be
    /// written, the store cannot be opened or the watcher cannot start.
    pub async fn start(settings: SessionSettings) -> Result<StartOutcome> {
        let paths = settings.resolve_paths()?;
        std::fs::create_dir_all(&paths.state_dir)?;

        let lock = match SessionLock::acquire(&paths.lock_file)? {
            Acquire::Acquired(lock) => lock,
            Acquire::Held { pid } => {
                tracing::info!(pid, project = %paths.project_id, "session already running");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
        };

        let mut indexer_config = settings.indexer;
        indexer_config.project_id.clone_from(&paths.project_id);
        indexer_config.validate()?;

        let scanner = Scanner::new(
            &paths.root,
            ScannerConfig {
                state_dir: Some(paths.state_dir.clone()),
                ..settings.scanner
            },
        )?;
        let store = Arc::new(
            AnyStore::open(&StoreConfig {
                sqlite_path: paths.sqlite_path.clone(),
                ..settings.store
            })
            .await?,
        );
        let indexer = Arc::new(Indexer::new(Arc::clone(&store), scanner, indexer_config)?);

        let cancel = CancellationToken::new();
        // Subscribe before the first pass so no change slips between the two.
        let watcher = settings
            .watch
            .map(|config| IndexWatcher::start(Arc::clone(&indexer), config, &cancel))
            .transpose()?;

        let initial_pass = tokio::spawn({
            let indexer = Arc::clone(&indexer);
            let cancel = cancel.clone();
            async move { indexer.reconcile_all(&cancel).await }
        });

        tracing::info!(
            project = %paths.project_id,
            root = %paths.root.display(),
            ranking = %store.ranking_mode(),
            watching = watcher.is_some(),
            "session started"
        );
        Ok(StartOutcome::Started(Self {
            _cancel_on_drop: cancel.clone().drop_guard(),
            paths,
            store,
            indexer,
            watcher,
            initial_pass: Some(initial_pass),
            cancel,
            lock,
        }))
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.paths.project_id
    }

    #[must_use]
    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AnyStore> {
        &self.store
    }

    #[must_use]
    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    #[must_use]
    pub fn ranking_mode(&self) -> RankingMode {
        self.store.ranking_mode()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn watch_stats(&self) -> Option<WatchStats> {
        self.watcher.as_ref().map(IndexWatcher::stats)
    }

    /// Ranked chunks of this project. Fails with `Cancelled` once the
    /// session is stopping.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the session stops.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        Ok(self
            .store
            .search_until_cancelled(&self.paths.project_id, query, limit, &self.cancel)
            .await?)
    }

    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.get_stats(&self.paths.project_id).await?)
    }

    /// Wait for the initial reconciliation. Returns `None` once it has
    /// already been awaited.
    ///
    /// # Errors
    ///
    /// Returns the pass's error, or an error if its task panicked.
    pub async fn wait_initial_pass(&mut self) -> Result<Option<IndexReport>> {
        match self.initial_pass.take() {
            Some(handle) => Ok(Some(handle.await??)),
            None => Ok(None),
        }
    }

    /// Run an extra full reconciliation now.
    ///
    /// # Errors
    ///
    /// Returns an error when storage becomes unreachable.
    pub async fn reindex(&self) -> Result<IndexReport> {
        self.indexer.reconcile_all(&self.cancel).await
    }

    /// Cancel background work, wait up to `grace` for it, then close the
    /// store and release the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if a background task panicked or the lock file
    /// cannot be removed. The lock is released either way.
    pub async fn stop(self, grace: Duration) -> Result<StopSummary> {
        self.cancel.cancel();
        let mut summary = StopSummary::default();
        let mut failure: Option<IndexError> = None;

        if let Some(mut handle) = self.initial_pass {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(Ok(report))) => summary.initial_pass = Some(report),
                Ok(Ok(Err(e))) => tracing::warn!("initial reconciliation failed: {e}"),
                Ok(Err(e)) => failure = Some(e.into()),
                Err(_) => {
                    tracing::warn!(?grace, "initial reconciliation did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        if let Some(watcher) = self.watcher {
            match watcher.stop(grace).await {
                Ok(stats) => summary.watch = Some(stats),
                Err(e) => failure = Some(e),
            }
        }

        self.store.close().await;
        let released = self.lock.release();
        tracing::info!(project = %self.paths.project_id, "session stopped");

        if let Some(e) = failure {
            return Err(e);
        }
        released?;
        Ok(summary)
    }
}

/// PID of the live process owning the project under `state_dir`, if any.
///
/// # Errors
///
/// Returns an error if the lock file exists but cannot be read.
pub fn running_owner(state_dir: &Path) -> Result<Option<u32>> {
    let lock_file = state_dir.join(LOCK_FILE);
    if !is_held(&lock_file)? {
        return Ok(None);
    }
    Ok(read_owner(&lock_file)?.filter(|pid| is_alive(*pid)))
}
