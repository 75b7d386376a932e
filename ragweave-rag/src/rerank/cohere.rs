//! Cohere hosted rerank API (`/v2/rerank`).

use super::{RerankConfig, RerankedNode, Reranker, finish};
use crate::node::{Node, ScoredNode};
use async_trait::async_trait;
use ragweave_core::providers::{build_http_client, map_status_error, map_transport_error, with_retry};
use ragweave_core::{ConfigError, LlmError, PipelineStage, RagError, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.cohere.com";
pub const DEFAULT_MODEL: &str = "rerank-english-v3.0";
pub const DEFAULT_API_KEY_ENV: &str = "COHERE_API_KEY";

#[derive(Serialize)]
struct CohereRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct CohereResponse {
    results: Vec<CohereResult>,
}

#[derive(Deserialize)]
struct CohereResult {
    index: usize,
    relevance_score: f32,
}

pub struct CohereReranker {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl CohereReranker {
    pub fn new(config: &RerankConfig, api_key: String, retry: RetryConfig) -> Result<Self, ConfigError> {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            url: format!("{}/v2/rerank", base.trim_end_matches('/')),
            api_key,
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout_secs: config.timeout_secs,
            retry,
        })
    }

    async fn request(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<CohereResult>, LlmError> {
        let body = CohereRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        };
        let resp = self
            .client
            .post(&self.url)
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
            return Err(map_status_error("cohere", status.as_u16(), &text));
        }
        let parsed: CohereResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid Cohere response: {}", e),
            })?;
        Ok(parsed.results)
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    fn name(&self) -> &str {
        "cohere"
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
        let wanted = top_n.min(documents.len());
        let results = with_retry(&self.retry, || self.request(query, &documents, wanted))
            .await
            .map_err(|e| RagError::external(PipelineStage::Rerank, e))?;

        let mut items: Vec<(Arc<Node>, String, f32)> = Vec::with_capacity(results.len());
        for result in results {
            let Some(candidate) = candidates.get(result.index) else {
                return Err(RagError::external(
                    PipelineStage::Rerank,
                    LlmError::ResponseParse {
                        message: format!("Cohere returned unknown document index {}", result.index),
                    },
                ));
            };
            items.push((
                candidate.node.clone(),
                documents[result.index].clone(),
                result.relevance_score,
            ));
        }
        debug!(model = %self.model, kept = items.len(), "Cohere reranked candidates");
        Ok(finish(items, top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let reranker =
            CohereReranker::new(&RerankConfig::default(), "key".into(), RetryConfig::none()).unwrap();
        assert_eq!(reranker.url, "https://api.cohere.com/v2/rerank");
        assert_eq!(reranker.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_request_shape() {
        let docs = vec!["a".to_string(), "b".to_string()];
        let body = serde_json::to_value(CohereRequest {
            model: "m",
            query: "q",
            documents: &docs,
            top_n: 1,
        })
        .unwrap();
        assert_eq!(body["documents"][1], "b");
        assert_eq!(body["top_n"], 1);
    }
}
