//! Filesystem watcher feeding debounced reconciliations to the [`Indexer`].

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::indexer::Indexer;
use crate::scanner::Scanner;

/// Raw notifications buffered between the OS watcher and the flush loop.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Pending {
    first_seen: Instant,
    deadline: Instant,
}

/// Coalesces bursts of triggers per key.
///
/// Each `record` pushes the key's deadline to `now + window`, but never past
/// `first_seen + max_delay`, so a key that keeps changing still flushes.
/// At most one entry exists per key.
#[derive(Debug)]
pub struct Debouncer<K = PathBuf> {
    window: Duration,
    max_delay: Duration,
    pending: HashMap<K, Pending>,
}

impl<K: Eq + Hash> Debouncer<K> {
    #[must_use]
    pub fn new(window: Duration, max_delay: Duration) -> Self {
        Self {
            window,
            max_delay: max_delay.max(window),
            pending: HashMap::new(),
        }
    }

    pub fn record(&mut self, key: K, now: Instant) {
        let entry = self.pending.entry(key).or_insert(Pending {
            first_seen: now,
            deadline: now,
        });
        entry.deadline = (now + self.window).min(entry.first_seen + self.max_delay);
    }

    /// Remove and return every key whose deadline has passed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<K> {
        let (due, waiting): (HashMap<K, Pending>, HashMap<K, Pending>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|(_, p)| p.deadline <= now);
        self.pending = waiting;
        due.into_keys().collect()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a changed path is reconciled (default: 300 ms).
    pub debounce: Duration,
    /// Longest a path may stay pending under constant churn (default: 3 s).
    pub max_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            max_delay: Duration::from_secs(3),
        }
    }
}

/// Counters for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchStats {
    pub events_received: u64,
    pub paths_flushed: u64,
    pub full_passes: u64,
    pub overflows: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    paths_flushed: AtomicU64,
    full_passes: AtomicU64,
    overflows: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WatchStats {
        WatchStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            paths_flushed: self.paths_flushed.load(Ordering::Relaxed),
            full_passes: self.full_passes.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Trigger {
    Path(PathBuf),
    /// Ignore rules changed or events were lost; re-walk the whole tree.
    Rescan,
}

/// Handle to the background watch loop.
pub struct IndexWatcher {
    cancel: CancellationToken,
    counters: Arc<Counters>,
    handle: JoinHandle<()>,
}

impl IndexWatcher {
    /// Subscribe to the indexer's project root and start the flush loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be created or the root
    /// cannot be watched.
    pub fn start(
        indexer: Arc<Indexer>,
        config: WatcherConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let overflow = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&overflow);

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if tx.try_send(event).is_err() {
                        overflow_flag.store(true, Ordering::Release);
                    }
                }
                Err(e) => tracing::warn!("index watcher error: {e}"),
            })?;
        watcher.watch(indexer.scanner().root(), RecursiveMode::Recursive)?;
        tracing::info!(root = %indexer.scanner().root().display(), "watching for changes");

        let cancel = cancel.child_token();
        let counters = Arc::new(Counters::default());
        let watch_loop = WatchLoop {
            indexer,
            debouncer: Debouncer::new(config.debounce, config.max_delay),
            counters: Arc::clone(&counters),
            overflow,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(watch_loop.run(rx, watcher));

        Ok(Self {
            cancel,
            counters,
            handle,
        })
    }

    #[must_use]
    pub fn stats(&self) -> WatchStats {
        self.counters.snapshot()
    }

    /// Stop the loop and release the OS watcher.
    ///
    /// A reconciliation in flight gets up to `grace` to complete; after
    /// that the task is aborted, which rolls back any open store write.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop task panicked.
    pub async fn stop(self, grace: Duration) -> Result<WatchStats> {
        self.cancel.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                tracing::warn!(?grace, "watcher did not stop in time, aborting");
                handle.abort();
                if let Err(e) = handle.await
                    && !e.is_cancelled()
                {
                    return Err(e.into());
                }
            }
        }
        let stats = self.counters.snapshot();
        tracing::info!(
            events = stats.events_received,
            flushed = stats.paths_flushed,
            full_passes = stats.full_passes,
            "watcher stopped"
        );
        Ok(stats)
    }
}

struct WatchLoop {
    indexer: Arc<Indexer>,
    debouncer: Debouncer<Trigger>,
    counters: Arc<Counters>,
    overflow: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WatchLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>, watcher: RecommendedWatcher) {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.accept(event).await,
                    None => break,
                },
                () = sleep_until(deadline) => {}
            }

            if self.overflow.swap(false, Ordering::AcqRel) {
                self.counters.overflows.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("watch event buffer overflowed, scheduling full rescan");
                self.debouncer.record(Trigger::Rescan, Instant::now());
            }
            self.flush().await;
        }
        // Close the channel before the watcher so its thread never blocks.
        drop(rx);
        drop(watcher);
    }

    async fn accept(&mut self, event: Event) {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        if event.need_rescan() {
            self.debouncer.record(Trigger::Rescan, now);
            return;
        }
        for path in event.paths {
            if let Some(trigger) = classify(&self.indexer, &path, event.kind).await {
                self.debouncer.record(trigger, now);
            }
        }
    }

    async fn flush(&mut self) {
        let due = self.debouncer.drain_due(Instant::now());
        if due.is_empty() {
            return;
        }
        if due.contains(&Trigger::Rescan) {
            // A full pass covers every pending path as well.
            self.debouncer.clear();
            self.counters.full_passes.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.indexer.reconcile_all(&self.cancel).await {
                tracing::warn!("full reconciliation failed: {e}");
            }
            return;
        }
        for trigger in due {
            if self.cancel.is_cancelled() {
                break;
            }
            let Trigger::Path(path) = trigger else {
                continue;
            };
            self.counters.paths_flushed.fetch_add(1, Ordering::Relaxed);
            match self.indexer.reconcile_path(&path).await {
                Ok(report) if report.files_changed() > 0 => tracing::debug!(
                    path = %path.display(),
                    added = report.files_added,
                    updated = report.files_updated,
                    removed = report.files_removed,
                    "reconciled"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), "reconcile failed: {e}"),
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Decide whether an event path deserves a reconciliation.
async fn classify(indexer: &Indexer, path: &Path, kind: EventKind) -> Option<Trigger> {
    let scanner = indexer.scanner();
    if scanner.in_state_dir(path) {
        return None;
    }
    let rel = scanner.relative_path(path)?;
    if rel == ".git" || rel.starts_with(".git/") {
        return None;
    }
    if Scanner::is_rule_file(path) {
        return Some(Trigger::Rescan);
    }

    let trigger = Some(Trigger::Path(path.to_path_buf()));
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            // Content changes inside a directory arrive as their own events.
            let appeared = matches!(
                kind,
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
            );
            if appeared { trigger } else { None }
        }
        Ok(_) => {
            let checker = scanner.clone();
            let abs = path.to_path_buf();
            let eligible = tokio::task::spawn_blocking(move || checker.is_eligible(&abs))
                .await
                .unwrap_or(false);
            if eligible || tracked(indexer, &rel).await {
                trigger
            } else {
                None
            }
        }
        Err(_) => {
            if tracked(indexer, &rel).await {
                trigger
            } else {
                None
            }
        }
    }
}

async fn tracked(indexer: &Indexer, rel: &str) -> bool {
    indexer.is_tracked(rel).await.unwrap_or_else(|e| {
        tracing::debug!(path = rel, "document lookup failed, reconciling anyway: {e}");
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(500);

    #[test]
    fn burst_for_one_path_yields_one_trigger() {
        let mut debouncer = Debouncer::new(WINDOW, MAX);
        let t0 = Instant::now();
        for i in 0..10 {
            debouncer.record(PathBuf::from("src/a.rs"), t0 + Duration::from_millis(i * 10));
        }
        assert_eq!(debouncer.len(), 1);
        assert!(debouncer.drain_due(t0 + Duration::from_millis(150)).is_empty());

        let due = debouncer.drain_due(t0 + Duration::from_millis(190));
        assert_eq!(due, vec![PathBuf::from("src/a.rs")]);
        assert!(debouncer.is_empty());
    }

    #[test]
    fn new_event_pushes_deadline_back() {
        let mut debouncer = Debouncer::new(WINDOW, MAX);
        let t0 = Instant::now();
        debouncer.record("a", t0);
        assert_eq!(debouncer.next_deadline(), Some(t0 + WINDOW));
        debouncer.record("a", t0 + Duration::from_millis(60));
        assert_eq!(
            debouncer.next_deadline(),
            Some(t0 + Duration::from_millis(160))
        );
    }

    #[test]
    fn continuous_churn_flushes_at_max_delay() {
        let mut debouncer = Debouncer::new(WINDOW, MAX);
        let t0 = Instant::now();
        let mut t = t0;
        while t < t0 + Duration::from_secs(2) {
            debouncer.record("hot.rs", t);
            if !debouncer.drain_due(t).is_empty() {
                break;
            }
            t += Duration::from_millis(50);
        }
        assert!(t <= t0 + MAX + Duration::from_millis(50));
    }

    #[test]
    fn paths_flush_independently() {
        let mut debouncer = Debouncer::new(WINDOW, MAX);
        let t0 = Instant::now();
        debouncer.record("a", t0);
        debouncer.record("b", t0 + Duration::from_millis(80));
        assert_eq!(debouncer.next_deadline(), Some(t0 + WINDOW));

        assert_eq!(debouncer.drain_due(t0 + WINDOW), vec!["a"]);
        assert_eq!(debouncer.len(), 1);
        assert_eq!(
            debouncer.drain_due(t0 + Duration::from_millis(180)),
            vec!["b"]
        );
        assert_eq!(debouncer.next_deadline(), None);
    }

    #[test]
    fn max_delay_never_below_window() {
        let mut debouncer = Debouncer::new(WINDOW, Duration::ZERO);
        let t0 = Instant::now();
        debouncer.record("a", t0);
        assert_eq!(debouncer.next_deadline(), Some(t0 + WINDOW));
    }

    #[test]
    fn watcher_config_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(300));
        assert_eq!(config.max_delay, Duration::from_secs(3));
    }
}
