//! Incremental code indexing with live file watching and ranked retrieval.
//!
//! The scanner walks a project tree honouring ignore rules, the chunker cuts
//! files into overlapping line windows, and the indexer reconciles the store
//! with the filesystem by content hash. A watcher keeps the index fresh while
//! the store answers lexical (BM25) or vector (cosine) searches scoped by
//! project id.

pub mod chunker;
pub(crate) mod context;
pub mod error;
pub mod indexer;
pub mod scanner;
pub mod session;
pub mod store;
pub mod types;
pub mod watcher;

pub use chunker::ChunkerConfig;
pub use error::{IndexError, Result};
pub use indexer::{FileOutcome, IndexReport, Indexer, IndexerConfig};
pub use scanner::{Scanner, ScannerConfig};
pub use session::{Session, SessionSettings, StartOutcome};
pub use store::{AnyStore, RankingMode, StoreBackend, StoreConfig, StoreError};
pub use types::{Chunk, Document, SearchResult, StoreStats};
pub use watcher::{Debouncer, IndexWatcher, WatchStats, WatcherConfig};
