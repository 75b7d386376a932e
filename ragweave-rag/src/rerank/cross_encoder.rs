//! Cross-encoder reranking.
//!
//! The relevance model scores every (query, document) pair in one batch.
//! [`HttpRelevanceModel`] talks to any server exposing the `/v1/rerank`
//! endpoint (text-embeddings-inference, llama.cpp, vLLM and friends).

use super::{RerankConfig, RerankedNode, Reranker, finish};
use crate::node::ScoredNode;
use async_trait::async_trait;
use ragweave_core::providers::{build_http_client, map_status_error, map_transport_error, with_retry};
use ragweave_core::{ConfigError, LlmError, PipelineStage, RagError, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MODEL: &str = "cross-encoder/ms-marco-MiniLM-L-2-v2";

/// Pairwise relevance scorer.
#[async_trait]
pub trait RelevanceModel: Send + Sync {
    /// One score per document, aligned with `documents`. Higher is more relevant.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError>;

    fn model_id(&self) -> &str;
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f32,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Cross-encoder served over HTTP. Raw logits are squashed with a sigmoid.
pub struct HttpRelevanceModel {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl HttpRelevanceModel {
    pub fn new(config: &RerankConfig, retry: RetryConfig) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::missing_field("rerank.base_url"))?;
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            url: format!("{}/v1/rerank", base_url.trim_end_matches('/')),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout_secs: config.timeout_secs,
            retry,
        })
    }

    async fn request(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n: documents.len(),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;
        if !status.is_success() {
            return Err(map_status_error("cross-encoder", status.as_u16(), &text));
        }
        let parsed: RerankResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid rerank response: {}", e),
            })?;

        let mut scores = vec![None; documents.len()];
        for item in parsed.results {
            match scores.get_mut(item.index) {
                Some(slot) => *slot = Some(sigmoid(item.relevance_score)),
                None => {
                    return Err(LlmError::ResponseParse {
                        message: format!(
                            "rerank result index {} out of range for {} documents",
                            item.index,
                            documents.len()
                        ),
                    });
                }
            }
        }
        Ok(scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.unwrap_or_else(|| {
                    warn!(index = i, "Relevance model returned no score for document");
                    0.0
                })
            })
            .collect())
    }
}

#[async_trait]
impl RelevanceModel for HttpRelevanceModel {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        with_retry(&self.retry, || self.request(query, documents)).await
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Re-scores each candidate with a [`RelevanceModel`] and keeps the best `top_n`.
pub struct CrossEncoderReranker {
    model: Arc<dyn RelevanceModel>,
}

impl CrossEncoderReranker {
    pub fn new(model: Arc<dyn RelevanceModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "custom"
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredNode>,
        top_n: usize,
    ) -> Result<Vec<RerankedNode>, RagError> {
        if candidates.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }
        let documents: Vec<String> = candidates.iter().map(|c| c.node.text.clone()).collect();
        let scores = self
            .model
            .score(query, &documents)
            .await
            .map_err(|e| RagError::external(PipelineStage::Rerank, e))?;
        if scores.len() != candidates.len() {
            return Err(RagError::external(
                PipelineStage::Rerank,
                LlmError::ResponseParse {
                    message: format!(
                        "relevance model returned {} scores for {} documents",
                        scores.len(),
                        candidates.len()
                    ),
                },
            ));
        }
        debug!(model = self.model.model_id(), scored = scores.len(), "Cross-encoder scored candidates");
        let items = candidates
            .into_iter()
            .zip(documents)
            .zip(scores)
            .map(|((c, text), score)| (c.node, text, score))
            .collect();
        Ok(finish(items, top_n))
    }
}
