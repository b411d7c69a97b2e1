mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sift_index::store::{EmbedderConfig, PathBooster, StoreConfig};
use sift_index::{ChunkerConfig, IndexerConfig, ScannerConfig, SessionSettings, WatcherConfig};

/// Config file looked up under the project root when `SIFT_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = ".sift/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Config path for a project: `SIFT_CONFIG` if set, else
    /// `<root>/.sift/config.toml`.
    #[must_use]
    pub fn default_path(root: &Path) -> PathBuf {
        std::env::var_os("SIFT_CONFIG")
            .map_or_else(|| root.join(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let index = &self.index;
        if index.chunk_size == 0 {
            return Err(invalid("index.chunk_size must be > 0"));
        }
        if index.overlap >= index.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "index.overlap ({}) must be smaller than index.chunk_size ({})",
                index.overlap, index.chunk_size
            )));
        }
        if index.batch_size == 0 {
            return Err(invalid("index.batch_size must be > 0"));
        }
        if index.concurrency == 0 {
            return Err(invalid("index.concurrency must be > 0"));
        }
        if index.store_timeout_secs == 0 {
            return Err(invalid("index.store_timeout_secs must be > 0"));
        }
        if self.store.pool_size == 0 {
            return Err(invalid("store.pool_size must be > 0"));
        }
        if self.store.sqlite_path.trim().is_empty() {
            return Err(invalid("store.sqlite_path must not be empty"));
        }
        if self.embedding.dimension == 0 {
            return Err(invalid("embedding.dimension must be > 0"));
        }
        if self
            .project
            .id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(invalid("project.id must not be blank"));
        }
        PathBooster::new(&self.boost.rules)
            .map_err(|e| ConfigError::Invalid(format!("boost.rules: {e}")))?;
        Ok(())
    }

    /// Engine settings for a project. A relative `project.root` is resolved
    /// against `base`.
    #[must_use]
    pub fn session_settings(&self, base: &Path) -> SessionSettings {
        let root = if self.project.root.is_absolute() {
            self.project.root.clone()
        } else {
            base.join(&self.project.root)
        };

        let mut indexer = IndexerConfig::new(self.project.id.clone().unwrap_or_default());
        indexer.chunker = ChunkerConfig {
            chunk_size: self.index.chunk_size,
            overlap: self.index.overlap,
        };
        indexer.batch_size = self.index.batch_size;
        indexer.concurrency = self.index.concurrency;
        indexer.store_timeout = Duration::from_secs(self.index.store_timeout_secs);

        SessionSettings {
            root,
            state_dir: self.session.state_dir.clone(),
            scanner: ScannerConfig {
                max_file_size: self.index.max_file_size,
                follow_symlinks: self.index.follow_symlinks,
                include_hidden: self.index.include_hidden,
                extra_ignores: self.index.extra_ignores.clone(),
                state_dir: None,
            },
            indexer,
            store: self.store_config(),
            watch: self.watch.enabled.then(|| WatcherConfig {
                debounce: Duration::from_millis(self.watch.debounce_ms),
                max_delay: Duration::from_millis(self.watch.max_delay_ms),
            }),
        }
    }

    /// Store settings; `sqlite_path` is left as configured (possibly relative).
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            backend: self.store.backend,
            sqlite_path: PathBuf::from(&self.store.sqlite_path),
            pool_size: self.store.pool_size,
            accelerated_ranking: self.store.accelerated_ranking,
            qdrant_url: self.store.qdrant_url.clone(),
            embedder: EmbedderConfig {
                provider: self.embedding.provider,
                dimension: self.embedding.dimension,
                base_url: self.embedding.base_url.clone(),
                model: self.embedding.model.clone(),
            },
            boost_rules: self.boost.rules.clone(),
        }
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.session.stop_grace_secs)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_owned())
}
