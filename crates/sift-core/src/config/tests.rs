use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serial_test::serial;
use sift_index::store::{BoostRule, EmbeddingProvider, StoreBackend};

use super::*;

const ENV_KEYS: [&str; 11] = [
    "SIFT_CONFIG",
    "SIFT_PROJECT_ID",
    "SIFT_STORE_BACKEND",
    "SIFT_SQLITE_PATH",
    "SIFT_QDRANT_URL",
    "SIFT_CHUNK_SIZE",
    "SIFT_CHUNK_OVERLAP",
    "SIFT_DEBOUNCE_MS",
    "SIFT_WATCH_ENABLED",
    "SIFT_EMBEDDING_PROVIDER",
    "SIFT_EMBEDDING_MODEL",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{body}").unwrap();
    path
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.index.chunk_size, 50);
    assert_eq!(config.index.overlap, 10);
    assert_eq!(config.index.batch_size, 64);
    assert_eq!(config.index.max_file_size, 1_048_576);
    assert!(config.watch.enabled);
    assert_eq!(config.watch.debounce_ms, 300);
    assert_eq!(config.store.backend, StoreBackend::Lexical);
    assert_eq!(config.store.sqlite_path, ".sift/index.db");
    assert!(config.store.accelerated_ranking);
    assert!(config.store.qdrant_url.is_none());
    assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
    assert_eq!(config.embedding.dimension, 384);
    assert!(!config.boost.rules.is_empty());
    assert_eq!(config.session.state_dir, Path::new(".sift"));
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn load_missing_file_uses_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
#[serial]
fn parse_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[project]
id = "web"

[index]
chunk_size = 20
overlap = 5
extra_ignores = ["fixtures/"]

[watch]
debounce_ms = 150

[store]
backend = "vector"
qdrant_url = "http://localhost:6334"

[embedding]
provider = "ollama"
model = "mxbai-embed-large"

[[boost.rules]]
pattern = "tests/**"
factor = 0.5
"#,
    );
    clear_env();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.project.id.as_deref(), Some("web"));
    assert_eq!(config.index.chunk_size, 20);
    assert_eq!(config.index.overlap, 5);
    assert_eq!(config.index.batch_size, 64);
    assert_eq!(config.index.extra_ignores, vec!["fixtures/".to_string()]);
    assert_eq!(config.watch.debounce_ms, 150);
    assert!(config.watch.enabled);
    assert_eq!(config.store.backend, StoreBackend::Vector);
    assert_eq!(config.store.qdrant_url.as_deref(), Some("http://localhost:6334"));
    assert_eq!(config.embedding.provider, EmbeddingProvider::Ollama);
    assert_eq!(config.embedding.model, "mxbai-embed-large");
    assert_eq!(config.boost.rules, vec![BoostRule::new("tests/**", 0.5)]);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn malformed_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[index\nchunk_size = ");
    clear_env();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("failed to parse config file"));
}

#[test]
#[serial]
fn env_overrides_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[index]\nchunk_size = 20\noverlap = 5\n");
    clear_env();
    unsafe {
        std::env::set_var("SIFT_PROJECT_ID", "api");
        std::env::set_var("SIFT_STORE_BACKEND", "vector");
        std::env::set_var("SIFT_SQLITE_PATH", "/var/lib/sift/index.db");
        std::env::set_var("SIFT_QDRANT_URL", "http://qdrant:6334");
        std::env::set_var("SIFT_CHUNK_SIZE", "40");
        std::env::set_var("SIFT_CHUNK_OVERLAP", "8");
        std::env::set_var("SIFT_DEBOUNCE_MS", "500");
        std::env::set_var("SIFT_WATCH_ENABLED", "false");
        std::env::set_var("SIFT_EMBEDDING_PROVIDER", "ollama");
        std::env::set_var("SIFT_EMBEDDING_MODEL", "all-minilm");
    }

    let config = Config::load(&path).unwrap();
    clear_env();

    assert_eq!(config.project.id.as_deref(), Some("api"));
    assert_eq!(config.store.backend, StoreBackend::Vector);
    assert_eq!(config.store.sqlite_path, "/var/lib/sift/index.db");
    assert_eq!(config.store.qdrant_url.as_deref(), Some("http://qdrant:6334"));
    assert_eq!(config.index.chunk_size, 40);
    assert_eq!(config.index.overlap, 8);
    assert_eq!(config.watch.debounce_ms, 500);
    assert!(!config.watch.enabled);
    assert_eq!(config.embedding.provider, EmbeddingProvider::Ollama);
    assert_eq!(config.embedding.model, "all-minilm");
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    unsafe {
        std::env::set_var("SIFT_STORE_BACKEND", "graph");
        std::env::set_var("SIFT_CHUNK_SIZE", "lots");
        std::env::set_var("SIFT_WATCH_ENABLED", "maybe");
        std::env::set_var("SIFT_EMBEDDING_PROVIDER", "magic");
    }
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("none.toml")).unwrap();
    clear_env();

    assert_eq!(config.store.backend, StoreBackend::Lexical);
    assert_eq!(config.index.chunk_size, 50);
    assert!(config.watch.enabled);
    assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
}

#[test]
#[serial]
fn empty_qdrant_url_disables_mirror() {
    clear_env();
    unsafe { std::env::set_var("SIFT_QDRANT_URL", " ") };
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("none.toml")).unwrap();
    clear_env();
    assert!(config.store.qdrant_url.is_none());
}

#[test]
#[serial]
fn config_path_honours_env() {
    clear_env();
    let root = Path::new("/work/repo");
    assert_eq!(
        Config::default_path(root),
        root.join(".sift").join("config.toml")
    );
    unsafe { std::env::set_var("SIFT_CONFIG", "/etc/sift.toml") };
    assert_eq!(Config::default_path(root), Path::new("/etc/sift.toml"));
    clear_env();
}

#[test]
fn validate_rejects_bad_chunking() {
    let mut config = Config::default();
    config.index.overlap = config.index.chunk_size;
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("index.overlap"));

    let mut config = Config::default();
    config.index.chunk_size = 0;
    config.index.overlap = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_zero_sizes() {
    for mutate in [
        (|c: &mut Config| c.index.batch_size = 0) as fn(&mut Config),
        |c: &mut Config| c.index.concurrency = 0,
        |c: &mut Config| c.index.store_timeout_secs = 0,
        |c: &mut Config| c.store.pool_size = 0,
        |c: &mut Config| c.embedding.dimension = 0,
    ] {
        let mut config = Config::default();
        mutate(&mut config);
        assert!(config.validate().is_err());
    }
}

#[test]
fn validate_rejects_bad_boost_rules() {
    let mut config = Config::default();
    config.boost.rules = vec![BoostRule::new("tests/**", 0.0)];
    assert!(config.validate().unwrap_err().to_string().contains("boost.rules"));

    config.boost.rules = vec![BoostRule::new("src/[", 1.5)];
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_blank_project_id() {
    let mut config = Config::default();
    config.project.id = Some("  ".into());
    assert!(config.validate().is_err());
}

#[test]
fn session_settings_carry_every_section() {
    let mut config = Config::default();
    config.project.id = Some("web".into());
    config.project.root = "app".into();
    config.index.chunk_size = 30;
    config.index.overlap = 3;
    config.index.include_hidden = true;
    config.watch.debounce_ms = 120;
    config.store.backend = StoreBackend::Vector;
    config.session.state_dir = "state".into();

    let settings = config.session_settings(Path::new("/srv"));
    assert_eq!(settings.root, Path::new("/srv/app"));
    assert_eq!(settings.state_dir, Path::new("state"));
    assert_eq!(settings.indexer.project_id, "web");
    assert_eq!(settings.indexer.chunker.chunk_size, 30);
    assert_eq!(settings.indexer.chunker.overlap, 3);
    assert_eq!(settings.indexer.store_timeout, Duration::from_secs(30));
    assert!(settings.scanner.include_hidden);
    assert_eq!(settings.store.backend, StoreBackend::Vector);
    assert_eq!(settings.store.embedder.dimension, 384);
    assert_eq!(
        settings.watch.as_ref().map(|w| w.debounce),
        Some(Duration::from_millis(120))
    );

    config.watch.enabled = false;
    config.project.id = None;
    let settings = config.session_settings(Path::new("/srv"));
    assert!(settings.watch.is_none());
    assert!(settings.indexer.project_id.is_empty());
}

#[test]
fn round_trips_through_toml() {
    let config = Config::default();
    let text = toml::to_string(&config).unwrap();
    let parsed: Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
}
