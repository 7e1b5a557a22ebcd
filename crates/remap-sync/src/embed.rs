//! Embedding collaborator: text in, dense + sparse vectors out.

use std::sync::Arc;

use async_trait::async_trait;
use remap_storage::{CollaboratorError, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Embedding {
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One embedding per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, CollaboratorError>;

    async fn embed(&self, text: &str) -> Result<Embedding, CollaboratorError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| CollaboratorError::Rejected("embedding service returned no vectors".to_string()))
    }
}

/// HTTP client for an embedding sidecar that serves both dense and sparse models.
///
/// Request: `POST {url}` with `{"texts": [...]}`.
/// Response: `{"dense": [[f32]], "sparse": [{"indices": [u32], "values": [f32]}]}`.
#[derive(Debug, Clone)]
pub struct EmbeddingServiceClient {
    http: Arc<HttpFetcher>,
    url: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    dense: Vec<Vec<f32>>,
    #[serde(default)]
    sparse: Vec<SparseVector>,
}

impl EmbeddingServiceClient {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingServiceClient {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, CollaboratorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbedRequest { texts };
        let response = self
            .http
            .send("embedder", |client| client.post(&self.url).json(&request))
            .await?;
        let body: EmbedResponse = response.json()?;
        if body.dense.len() != texts.len() {
            return Err(CollaboratorError::Rejected(format!(
                "embedding service returned {} dense vectors for {} texts",
                body.dense.len(),
                texts.len()
            )));
        }

        let mut sparse = body.sparse.into_iter();
        let embeddings = body
            .dense
            .into_iter()
            .map(|dense| Embedding {
                dense,
                sparse: sparse.next().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        debug!(count = embeddings.len(), "embedded batch");
        Ok(embeddings)
    }
}

/// Deterministic in-process embedder for offline runs and tests: hashed bag-of-words.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> u32 {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dimensions as u64) as u32
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut dense = vec![0f32; self.dimensions];
        let mut counts = std::collections::BTreeMap::<u32, f32>::new();
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
        {
            let bucket = self.bucket(&token);
            dense[bucket as usize] += 1.0;
            *counts.entry(bucket).or_default() += 1.0;
        }
        let norm = dense.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            dense.iter_mut().for_each(|v| *v /= norm);
        }
        Embedding {
            dense,
            sparse: SparseVector {
                indices: counts.keys().copied().collect(),
                values: counts.values().copied().collect(),
            },
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, CollaboratorError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
