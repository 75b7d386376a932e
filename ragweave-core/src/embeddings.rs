//! Pluggable embedding providers.
//!
//! Provides a trait-based abstraction over embedding models, with implementations
//! for a local hashed bag-of-words embedder (always available, deterministic),
//! the OpenAI API, a local Ollama server, and Hugging Face feature extraction.
//!
//! Remote failures surface as [`LlmError`]s. An embedder never substitutes a
//! zero vector for a failed call.

use crate::config::{EmbeddingConfig, EmbeddingProviderKind, ResolvedCredentials, RetryConfig};
use crate::error::{ConfigError, LlmError};
use crate::providers::{build_http_client, map_status_error, map_transport_error, with_retry};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Generate embeddings for a batch of texts, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;

    /// Identifies the model, for index fingerprints.
    fn model_id(&self) -> String {
        self.provider_name().to_string()
    }
}

/// Reject vectors whose length does not match what the embedder promised.
fn check_dimensions(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, LlmError> {
    if vector.len() != expected {
        return Err(LlmError::ResponseParse {
            message: format!(
                "embedding has {} dimensions, expected {}",
                vector.len(),
                expected
            ),
        });
    }
    Ok(vector)
}

fn json_to_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
}

/// Deterministic hashed bag-of-words embedder.
///
/// Lowercases, splits on non-alphanumerics, hashes each term into a bucket
/// weighted by its frequency, then L2-normalizes.
#[derive(Debug, Clone)]
pub struct LocalHashEmbedder {
    dimensions: usize,
}

impl LocalHashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// The synchronous core, usable outside an async context.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if words.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

/// djb2 string hash.
fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalHashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local-hash"
    }

    fn model_id(&self) -> String {
        format!("local-hash-{}", self.dimensions)
    }
}

/// OpenAI embeddings API.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    /// Sent as the `dimensions` request field when the user picked a size.
    requested_dims: Option<usize>,
    base_url: String,
    timeout_secs: u64,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "text-embedding-3-small".into());
        let native = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        let requested_dims = (config.dimensions > 0).then_some(config.dimensions);
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            api_key,
            model,
            dims: requested_dims.unwrap_or(native),
            requested_dims,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs: config.timeout_secs,
        })
    }

    async fn request(&self, input: Value) -> Result<Value, LlmError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut body = json!({ "model": self.model, "input": input });
        if let Some(dims) = self.requested_dims {
            body["dimensions"] = json!(dims);
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;
        if !status.is_success() {
            return Err(map_status_error("openai embeddings", status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().ok_or_else(|| LlmError::ResponseParse {
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let json = self.request(json!(texts)).await?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No data array in embedding response".to_string(),
            })?;
        if data.len() != texts.len() {
            return Err(LlmError::ResponseParse {
                message: format!("expected {} embeddings, got {}", texts.len(), data.len()),
            });
        }
        data.iter()
            .map(|item| {
                let vector = json_to_vector(&item["embedding"]).ok_or_else(|| {
                    LlmError::ResponseParse {
                        message: "embedding item has no vector".to_string(),
                    }
                })?;
                check_dimensions(vector, self.dims)
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> String {
        format!("openai/{}", self.model)
    }
}

/// Ollama embedder (uses the local Ollama API).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    base_url: String,
    timeout_secs: u64,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "nomic-embed-text".into());
        let native = match model.as_str() {
            "nomic-embed-text" => 768,
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768,
        };
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            model,
            dims: if config.dimensions > 0 {
                config.dimensions
            } else {
                native
            },
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".into())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().ok_or_else(|| LlmError::ResponseParse {
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model, "input": texts });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;
        if !status.is_success() {
            return Err(map_status_error("ollama", status.as_u16(), &text));
        }
        let json: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })?;

        let embeddings = json["embeddings"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No embeddings array in Ollama response".to_string(),
            })?;
        embeddings
            .iter()
            .map(|e| {
                let vector = json_to_vector(e).ok_or_else(|| LlmError::ResponseParse {
                    message: "embedding is not an array".to_string(),
                })?;
                check_dimensions(vector, self.dims)
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model_id(&self) -> String {
        format!("ollama/{}", self.model)
    }
}

/// Hugging Face feature-extraction pipeline (sentence-transformers models).
pub struct HuggingFaceEmbedder {
    client: reqwest::Client,
    token: String,
    model: String,
    dims: usize,
    url: String,
    timeout_secs: u64,
}

impl HuggingFaceEmbedder {
    pub fn new(config: &EmbeddingConfig, token: String) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "BAAI/bge-small-en-v1.5".into());
        let url = match &config.base_url {
            Some(base) => format!("{}/models/{}", base.trim_end_matches('/'), model),
            None => format!(
                "https://router.huggingface.co/hf-inference/models/{}/pipeline/feature-extraction",
                model
            ),
        };
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            token,
            dims: if config.dimensions > 0 {
                config.dimensions
            } else {
                384
            },
            model,
            url,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().ok_or_else(|| LlmError::ResponseParse {
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&json!({ "inputs": texts }))
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;
        if !status.is_success() {
            return Err(map_status_error("huggingface", status.as_u16(), &text));
        }
        let json: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })?;
        let rows = json.as_array().ok_or_else(|| LlmError::ResponseParse {
            message: "feature-extraction response is not an array".to_string(),
        })?;
        if rows.len() != texts.len() {
            return Err(LlmError::ResponseParse {
                message: format!("expected {} embeddings, got {}", texts.len(), rows.len()),
            });
        }
        rows.iter()
            .map(|row| {
                let vector = json_to_vector(row).ok_or_else(|| LlmError::ResponseParse {
                    message: "embedding row is not an array".to_string(),
                })?;
                check_dimensions(vector, self.dims)
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "huggingface"
    }

    fn model_id(&self) -> String {
        format!("huggingface/{}", self.model)
    }
}

/// Wraps an embedder so each call goes through [`with_retry`].
pub struct RetryingEmbedder {
    inner: Arc<dyn Embedder>,
    retry: RetryConfig,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        with_retry(&self.retry, || self.inner.embed(text)).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        with_retry(&self.retry, || self.inner.embed_batch(texts)).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model_id(&self) -> String {
        self.inner.model_id()
    }
}

/// Factory function to create an embedder based on configuration.
pub fn create_embedder(
    config: &EmbeddingConfig,
    credentials: &ResolvedCredentials,
    retry: &RetryConfig,
) -> Result<Arc<dyn Embedder>, ConfigError> {
    let key = match config.credential_requirement() {
        Some(req) => Some(credentials.key_for(&req)?),
        None => None,
    };
    let missing_key = || ConfigError::missing_field("embedding.api_key_env");

    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProviderKind::LocalHash => {
            let dims = if config.dimensions > 0 {
                config.dimensions
            } else {
                384
            };
            // Nothing remote to retry
            return Ok(Arc::new(LocalHashEmbedder::new(dims)));
        }
        EmbeddingProviderKind::OpenAi => {
            Arc::new(OpenAiEmbedder::new(config, key.ok_or_else(missing_key)?)?)
        }
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(config)?),
        EmbeddingProviderKind::HuggingFace => {
            Arc::new(HuggingFaceEmbedder::new(config, key.ok_or_else(missing_key)?)?)
        }
    };
    tracing::debug!(
        provider = embedder.provider_name(),
        dimensions = embedder.dimensions(),
        "Created embedder"
    );
    Ok(Arc::new(RetryingEmbedder::new(embedder, retry.clone())))
}

/// Cosine similarity between two vectors; 0.0 when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
