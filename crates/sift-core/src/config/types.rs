use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sift_index::store::{BoostRule, EmbeddingProvider, StoreBackend, default_rules};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub store: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub boost: BoostConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Tenant id. Derived from the canonical root when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            id: None,
            root: default_root(),
        }
    }
}

fn default_chunk_size() -> usize {
    50
}

fn default_overlap() -> usize {
    10
}

fn default_batch_size() -> usize {
    64
}

fn default_concurrency() -> usize {
    4
}

fn default_store_timeout_secs() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Lines per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Lines repeated between consecutive chunks.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub extra_ignores: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            store_timeout_secs: default_store_timeout_secs(),
            max_file_size: default_max_file_size(),
            follow_symlinks: false,
            include_hidden: false,
            extra_ignores: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_delay_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_sqlite_path() -> String {
    ".sift/index.db".into()
}

fn default_pool_size() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Use `SQLite` FTS5 ranking when available.
    #[serde(default = "default_true")]
    pub accelerated_ranking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qdrant_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: default_sqlite_path(),
            pool_size: default_pool_size(),
            accelerated_ranking: true,
            qdrant_url: None,
        }
    }
}

fn default_dimension() -> usize {
    384
}

fn default_embedding_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            dimension: default_dimension(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BoostConfig {
    /// Path glob → score multiplier. Replaces the built-in set when given.
    #[serde(default = "default_rules")]
    pub rules: Vec<BoostRule>,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".sift")
}

fn default_stop_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Lock file, database and config live here; relative to the root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}
