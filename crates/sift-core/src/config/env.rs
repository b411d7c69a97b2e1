use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIFT_PROJECT_ID") {
            self.project.id = Some(v);
        }
        if let Ok(v) = std::env::var("SIFT_STORE_BACKEND") {
            match v.parse() {
                Ok(backend) => self.store.backend = backend,
                Err(e) => tracing::warn!("ignoring invalid SIFT_STORE_BACKEND value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("SIFT_QDRANT_URL") {
            self.store.qdrant_url = Some(v).filter(|url| !url.trim().is_empty());
        }
        if let Ok(v) = std::env::var("SIFT_CHUNK_SIZE") {
            match v.parse::<usize>() {
                Ok(n) => self.index.chunk_size = n,
                Err(_) => tracing::warn!("ignoring invalid SIFT_CHUNK_SIZE value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_CHUNK_OVERLAP") {
            match v.parse::<usize>() {
                Ok(n) => self.index.overlap = n,
                Err(_) => tracing::warn!("ignoring invalid SIFT_CHUNK_OVERLAP value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_DEBOUNCE_MS") {
            match v.parse::<u64>() {
                Ok(ms) => self.watch.debounce_ms = ms,
                Err(_) => tracing::warn!("ignoring invalid SIFT_DEBOUNCE_MS value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_WATCH_ENABLED") {
            match v.parse::<bool>() {
                Ok(enabled) => self.watch.enabled = enabled,
                Err(_) => tracing::warn!("ignoring invalid SIFT_WATCH_ENABLED value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_PROVIDER") {
            match v.parse() {
                Ok(provider) => self.embedding.provider = provider,
                Err(e) => tracing::warn!("ignoring invalid SIFT_EMBEDDING_PROVIDER value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("SIFT_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
    }
}
