//! Embedding gateway abstraction and implementations.
//!
//! The engine treats embedding and cross-encoder models as black-box
//! scoring services behind the [`EmbeddingGateway`] trait:
//! - **[`HashingEmbedder`]**: deterministic feature-hashed bag-of-words
//!   vectors; no model, no network. Has no cross-encoder.
//! - **[`HttpEmbeddingGateway`]**: calls an Ollama-compatible `/api/embed`
//!   endpoint, and optionally a cross-encoder endpoint for reranking.
//!
//! Use [`create_gateway`] to build the configured gateway.
//!
//! # Retry Strategy
//!
//! The HTTP gateway uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EngineError;
use crate::text;

/// Embedding and reranking service consumed by the chunker, the sync
/// pipeline, and the search optimizer.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Returns the model identifier.
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Largest batch a single [`embed`](EmbeddingGateway::embed) call accepts.
    fn max_batch_size(&self) -> usize {
        64
    }

    /// Whether embeddings are computed on an accelerator.
    fn is_accelerated(&self) -> bool {
        false
    }

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Score `(query, document)` pairs jointly. Gateways without a
    /// cross-encoder return [`EngineError::RerankerUnavailable`].
    async fn rerank(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
        Err(EngineError::RerankerUnavailable.into())
    }
}

/// Embed `texts` in batches of at most `batch_size` (further capped by the
/// gateway's own limit). Fails if any batch fails or returns the wrong
/// number of vectors.
pub async fn embed_batched(
    gateway: &dyn EmbeddingGateway,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.min(gateway.max_batch_size()).max(1);
    let mut vectors = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size) {
        let embedded = gateway.embed(batch).await?;
        if embedded.len() != batch.len() {
            bail!(
                "Embedding gateway returned {} vectors for {} texts",
                embedded.len(),
                batch.len()
            );
        }
        vectors.extend(embedded);
    }

    Ok(vectors)
}

/// Embed a single query text.
pub async fn embed_query(gateway: &dyn EmbeddingGateway, text: &str) -> Result<Vec<f32>> {
    let results = gateway.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Build the gateway selected by `config.provider`.
pub fn create_gateway(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingGateway>, EngineError> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims)?)),
        "http" => Ok(Arc::new(HttpEmbeddingGateway::new(config)?)),
        other => Err(EngineError::Init(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Hashing Embedder ============

/// Deterministic embedder that hashes each token into one of `dims`
/// buckets with a ±1 sign, then L2-normalizes.
///
/// Texts sharing vocabulary land close together, which is enough for
/// offline operation and reproducible tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Result<Self, EngineError> {
        if dims == 0 {
            return Err(EngineError::Init("hashing embedder needs dims > 0".into()));
        }
        Ok(Self { dims })
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text::tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let idx = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingGateway for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        1024
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ============ HTTP Gateway ============

/// Gateway backed by an Ollama-compatible HTTP embedding service.
///
/// Calls `POST {url}/api/embed` with `{"model", "input"}` and expects
/// `{"embeddings": [[f32]]}`. When `rerank_url` is configured, reranking
/// calls `POST {rerank_url}` with `{"query", "documents"}` and expects
/// `{"scores": [f32]}`.
pub struct HttpEmbeddingGateway {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    rerank_url: Option<String>,
    batch_size: usize,
    max_retries: u32,
}

impl HttpEmbeddingGateway {
    /// Create a gateway from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Init`] if `model` is not set or the HTTP
    /// client cannot be built.
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EngineError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EngineError::Init("embedding.model required for http provider".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Init(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            model,
            dims: config.dims,
            url: url.trim_end_matches('/').to_string(),
            rerank_url: config.rerank_url.clone(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    /// POST `body` to `url`, retrying transient failures with backoff.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(url).json(body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "embedding service error, retrying");
                        last_err = Some(anyhow::anyhow!(
                            "Embedding service error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding service error {}: {}", status, body_text);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, url, "embedding service unreachable");
                    last_err = Some(anyhow::anyhow!(
                        "Embedding service connection error (is it running at {}?): {}",
                        url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding request failed after retries")))
    }
}

#[async_trait]
impl EmbeddingGateway for HttpEmbeddingGateway {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self
            .post_with_retry(&format!("{}/api/embed", self.url), &body)
            .await?;
        parse_embed_response(&json)
    }

    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let url = match &self.rerank_url {
            Some(u) => u,
            None => return Err(EngineError::RerankerUnavailable.into()),
        };
        let body = serde_json::json!({
            "query": query,
            "documents": documents,
        });
        let json = self.post_with_retry(url, &body).await?;
        parse_rerank_response(&json, documents.len())
    }
}

fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embed response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid embed response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f32>> {
    let scores: Vec<f32> = json
        .get("scores")
        .and_then(|s| s.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing scores array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect();

    if scores.len() != expected {
        bail!(
            "Invalid rerank response: {} scores for {} documents",
            scores.len(),
            expected
        );
    }
    Ok(scores)
}

// ============ Vector helpers ============

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
///
/// # Formula
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// `1 - cosine_similarity`, in `[0.0, 2.0]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64).unwrap();
        let a = e.embed_one("Redis listens on port 6379");
        let b = e.embed_one("Redis listens on port 6379");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_embedder_shared_vocabulary_is_closer() {
        let e = HashingEmbedder::new(256).unwrap();
        let q = e.embed_one("redis default port");
        let near = e.embed_one("the redis default port is 6379");
        let far = e.embed_one("kubernetes schedules pods onto nodes");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_hashing_embedder_rejects_zero_dims() {
        assert!(matches!(HashingEmbedder::new(0), Err(EngineError::Init(_))));
    }

    #[tokio::test]
    async fn test_hashing_embedder_has_no_reranker() {
        let e = HashingEmbedder::new(8).unwrap();
        let err = e.rerank("q", &["d".to_string()]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::RerankerUnavailable)
        ));
    }

    struct CountingGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingGateway for CountingGateway {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_batch_size(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_embed_batched_respects_gateway_limit() {
        let gw = CountingGateway {
            calls: AtomicUsize::new(0),
        };
        let texts: Vec<String> = (0..10).map(|i| "x".repeat(i)).collect();
        let vecs = embed_batched(&gw, &texts, 100).await.unwrap();
        assert_eq!(vecs.len(), 10);
        assert_eq!(gw.calls.load(Ordering::SeqCst), 3);
        assert_eq!(vecs[7][0], 7.0);
    }

    #[test]
    fn test_parse_embed_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 1.0], [0.0, -1.0]]});
        let parsed = parse_embed_response(&json).unwrap();
        assert_eq!(parsed, vec![vec![0.5, 1.0], vec![0.0, -1.0]]);
        assert!(parse_embed_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_rerank_response_checks_length() {
        let json = serde_json::json!({"scores": [0.1, 0.9]});
        assert_eq!(parse_rerank_response(&json, 2).unwrap(), vec![0.1, 0.9]);
        assert!(parse_rerank_response(&json, 3).is_err());
    }

    #[test]
    fn test_create_gateway() {
        let config = EmbeddingConfig::default();
        let gw = create_gateway(&config).unwrap();
        assert_eq!(gw.model_name(), "hashing");
        assert_eq!(gw.dims(), 256);

        let bad = EmbeddingConfig {
            provider: "quantum".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_gateway(&bad).is_err());
    }
}
