//! Text embedders for the vector backend.

use std::future::Future;

use serde::{Deserialize, Serialize};

use super::StoreError;
use super::tokenize;

/// Which embedder to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Hashing,
    Ollama,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown embedding provider `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderConfig {
    pub provider: EmbeddingProvider,
    /// Output size of the hashing embedder. Remote models report their own.
    pub dimension: usize,
    pub base_url: String,
    pub model: String,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            dimension: 384,
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
        }
    }
}

pub trait Embedder: Send + Sync {
    /// # Errors
    ///
    /// Returns `StoreError::Embedding` if the text cannot be embedded.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, StoreError>> + Send;

    fn name(&self) -> &'static str;
}

macro_rules! delegate_embedder {
    ($self:expr, |$e:ident| $expr:expr) => {
        match $self {
            AnyEmbedder::Hashing($e) => $expr,
            #[cfg(feature = "ollama")]
            AnyEmbedder::Ollama($e) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum AnyEmbedder {
    Hashing(HashingEmbedder),
    #[cfg(feature = "ollama")]
    Ollama(OllamaEmbedder),
}

impl AnyEmbedder {
    /// # Errors
    ///
    /// Returns `StoreError::Invalid` for a zero dimension or a provider that
    /// was compiled out.
    pub fn from_config(config: &EmbedderConfig) -> Result<Self, StoreError> {
        match config.provider {
            EmbeddingProvider::Hashing => {
                Ok(Self::Hashing(HashingEmbedder::new(config.dimension)?))
            }
            #[cfg(feature = "ollama")]
            EmbeddingProvider::Ollama => Ok(Self::Ollama(OllamaEmbedder::new(
                &config.base_url,
                config.model.clone(),
            ))),
            #[cfg(not(feature = "ollama"))]
            EmbeddingProvider::Ollama => Err(StoreError::Invalid(
                "ollama embeddings require the `ollama` feature".into(),
            )),
        }
    }

    /// Embed a fixed string to learn the output dimension.
    ///
    /// # Errors
    ///
    /// Propagates the embedder failure.
    pub async fn detect_dimension(&self) -> Result<usize, StoreError> {
        let vector = self.embed("dimension check").await?;
        if vector.is_empty() {
            return Err(StoreError::Embedding(format!(
                "{} returned an empty vector",
                self.name()
            )));
        }
        Ok(vector.len())
    }
}

impl Embedder for AnyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        delegate_embedder!(self, |e| e.embed(text).await)
    }

    fn name(&self) -> &'static str {
        delegate_embedder!(self, |e| e.name())
    }
}

/// Deterministic feature-hashing embedder. Needs no model and no network.
///
/// Each token is hashed into one of `dimension` buckets with a hash-derived
/// sign; the result is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// # Errors
    ///
    /// Returns `StoreError::Invalid` if `dimension` is zero.
    pub fn new(dimension: usize) -> Result<Self, StoreError> {
        if dimension == 0 {
            return Err(StoreError::Invalid("embedding dimension must be > 0".into()));
        }
        Ok(Self { dimension })
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in tokenize::tokenize(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&bytes[..8]);
            #[expect(clippy::cast_possible_truncation)]
            let idx = (u64::from_le_bytes(idx_bytes) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        Ok(self.embed_sync(text))
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

#[cfg(feature = "ollama")]
pub use ollama::OllamaEmbedder;

#[cfg(feature = "ollama")]
mod ollama {
    use ollama_rs::Ollama;
    use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

    use super::{Embedder, StoreError};
    use crate::store::error::is_transport_failure;

    #[derive(Debug, Clone)]
    pub struct OllamaEmbedder {
        client: Ollama,
        model: String,
    }

    impl OllamaEmbedder {
        #[must_use]
        pub fn new(base_url: &str, model: String) -> Self {
            let (host, port) = parse_host_port(base_url);
            Self {
                client: Ollama::new(host, port),
                model,
            }
        }
    }

    impl Embedder for OllamaEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
            let request =
                GenerateEmbeddingsRequest::new(self.model.clone(), EmbeddingsInput::from(text));
            let response = self
                .client
                .generate_embeddings(request)
                .await
                .map_err(|e| {
                    if is_transport_failure(&e) {
                        StoreError::Connection(format!("ollama unreachable: {e}"))
                    } else {
                        StoreError::Embedding(format!("ollama request failed: {e}"))
                    }
                })?;
            response
                .embeddings
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::Embedding("ollama returned no embedding".into()))
        }

        fn name(&self) -> &'static str {
            "ollama"
        }
    }

    pub(super) fn parse_host_port(url: &str) -> (String, u16) {
        let url = url.trim_end_matches('/');
        if let Some(colon) = url.rfind(':')
            && let Ok(port) = url[colon + 1..].parse::<u16>()
        {
            return (url[..colon].to_string(), port);
        }
        (url.to_string(), 11434)
    }

    #[cfg(test)]
    mod tests {
        use super::{Embedder, OllamaEmbedder, parse_host_port};

        #[test]
        fn host_and_port_split() {
            assert_eq!(
                parse_host_port("http://localhost:11434/"),
                ("http://localhost".to_string(), 11434)
            );
            assert_eq!(
                parse_host_port("http://gpu-box:8080"),
                ("http://gpu-box".to_string(), 8080)
            );
        }

        #[tokio::test]
        async fn unreachable_server_is_connectivity_error() {
            let embedder = OllamaEmbedder::new("http://127.0.0.1:1", "nomic-embed-text".into());
            let err = embedder.embed("fn main() {}").await.unwrap_err();
            assert!(err.is_connectivity(), "{err}");
        }

        #[test]
        fn missing_port_defaults() {
            assert_eq!(
                parse_host_port("http://localhost"),
                ("http://localhost".to_string(), 11434)
            );
        }
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Map cosine similarity from `[-1, 1]` onto a non-negative score.
pub(crate) fn cosine_to_score(cos: f32) -> f32 {
    ((1.0 + cos) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let a = embedder.embed("fn verify_token(token: &str)").await.unwrap();
        let b = embedder.embed("fn verify_token(token: &str)").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_tokens_score_higher() {
        let embedder = HashingEmbedder::new(256).unwrap();
        let query = embedder.embed("verify token").await.unwrap();
        let near = embedder.embed("fn verify(token) { token.verify() }").await.unwrap();
        let far = embedder.embed("render html template layout").await.unwrap();
        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn detect_reports_dimension() {
        let embedder = AnyEmbedder::from_config(&EmbedderConfig {
            dimension: 96,
            ..EmbedderConfig::default()
        })
        .unwrap();
        assert_eq!(embedder.detect_dimension().await.unwrap(), 96);
        assert_eq!(embedder.name(), "hashing");
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[test]
    fn score_mapping_bounds() {
        assert!((cosine_to_score(1.0) - 1.0).abs() < f32::EPSILON);
        assert!(cosine_to_score(-1.0).abs() < f32::EPSILON);
        assert!((cosine_to_score(0.0) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn provider_parses() {
        assert_eq!("Ollama".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Ollama));
        assert!("openai".parse::<EmbeddingProvider>().is_err());
    }
}
