//! Second-pass rerankers over fused candidates.
//!
//! Every variant honours the same contract: output is ordered best first and
//! never longer than `top_n`; empty input (or `top_n == 0`) yields an empty
//! list without calling any model.

pub mod cohere;
pub mod cross_encoder;
pub mod llm;
pub mod metadata;

use crate::node::{Node, ScoredNode, WINDOW_KEY};
use async_trait::async_trait;
use ragweave_core::{
    ConfigError, CredentialRequirement, LlmProvider, RagError, ResolvedCredentials, RetryConfig,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

pub use cohere::CohereReranker;
pub use cross_encoder::{CrossEncoderReranker, HttpRelevanceModel, RelevanceModel};
pub use llm::LlmReranker;
pub use metadata::MetadataReplacementReranker;

/// A candidate after reranking. `text` is what the answer step should see.
#[derive(Debug, Clone)]
pub struct RerankedNode {
    pub node: Arc<Node>,
    pub text: String,
    pub score: f32,
    pub rank: usize,
}

impl RerankedNode {
    /// Pass a fused node through unchanged.
    pub fn from_scored(scored: ScoredNode) -> Self {
        Self {
            text: scored.node.text.clone(),
            node: scored.node,
            score: scored.score,
            rank: scored.rank,
        }
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredNode>,
        top_n: usize,
    ) -> Result<Vec<RerankedNode>, RagError>;
}

/// Sort by score descending (stable), cut to `top_n` and assign dense ranks.
pub(crate) fn finish(mut items: Vec<(Arc<Node>, String, f32)>, top_n: usize) -> Vec<RerankedNode> {
    items.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    items
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(rank, (node, text, score))| RerankedNode {
            node,
            text,
            score,
            rank,
        })
        .collect()
}

/// Tag selecting a reranker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RerankStrategy {
    /// Pairwise cross-encoder relevance model.
    #[serde(rename = "custom", alias = "cross_encoder", alias = "cross-encoder")]
    CrossEncoder,
    #[serde(rename = "llm-reranker", alias = "llm")]
    Llm,
    /// Window-metadata substitution; scores untouched.
    #[serde(rename = "metadata")]
    Metadata,
    #[serde(rename = "cohere")]
    Cohere,
}

impl std::fmt::Display for RerankStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RerankStrategy::CrossEncoder => write!(f, "custom"),
            RerankStrategy::Llm => write!(f, "llm-reranker"),
            RerankStrategy::Metadata => write!(f, "metadata"),
            RerankStrategy::Cohere => write!(f, "cohere"),
        }
    }
}

impl FromStr for RerankStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "custom" | "cross_encoder" | "cross-encoder" => Ok(RerankStrategy::CrossEncoder),
            "llm-reranker" | "llm" => Ok(RerankStrategy::Llm),
            "metadata" => Ok(RerankStrategy::Metadata),
            "cohere" => Ok(RerankStrategy::Cohere),
            other => Err(ConfigError::unknown_strategy("rerank", other)),
        }
    }
}

/// Reranker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    /// No reranking when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RerankStrategy>,
    pub top_n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Documents per LLM reranking prompt.
    pub choice_batch_size: usize,
    /// Metadata entry swapped in by the metadata strategy.
    pub metadata_key: String,
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            top_n: 3,
            model: None,
            base_url: None,
            api_key_env: None,
            choice_batch_size: 10,
            metadata_key: WINDOW_KEY.to_string(),
            timeout_secs: 30,
        }
    }
}

impl RerankConfig {
    /// The API key a remote reranker needs, if any.
    pub fn credential_requirement(&self) -> Option<CredentialRequirement> {
        match self.strategy {
            Some(RerankStrategy::Cohere) => Some(CredentialRequirement {
                provider: "cohere reranker".to_string(),
                var: self
                    .api_key_env
                    .clone()
                    .unwrap_or_else(|| cohere::DEFAULT_API_KEY_ENV.to_string()),
            }),
            _ => None,
        }
    }
}

/// The single dispatch point from the configured strategy to a reranker.
///
/// `relevance_model` overrides the HTTP cross-encoder client, mainly for
/// embedding a local scorer or a test double.
pub fn build_reranker(
    config: &RerankConfig,
    llm: Option<Arc<dyn LlmProvider>>,
    relevance_model: Option<Arc<dyn RelevanceModel>>,
    credentials: &ResolvedCredentials,
    retry: &RetryConfig,
) -> Result<Option<Arc<dyn Reranker>>, ConfigError> {
    let Some(strategy) = config.strategy else {
        return Ok(None);
    };
    if config.top_n == 0 {
        return Err(ConfigError::invalid("rerank.top_n must be greater than 0"));
    }
    let reranker: Arc<dyn Reranker> = match strategy {
        RerankStrategy::CrossEncoder => {
            let model = match relevance_model {
                Some(model) => model,
                None => Arc::new(HttpRelevanceModel::new(config, retry.clone())?),
            };
            Arc::new(CrossEncoderReranker::new(model))
        }
        RerankStrategy::Llm => {
            let llm = llm.ok_or_else(|| {
                ConfigError::missing_dependency("llm-reranker", "an LLM")
            })?;
            Arc::new(LlmReranker::new(llm, config.choice_batch_size)?)
        }
        RerankStrategy::Metadata => {
            Arc::new(MetadataReplacementReranker::new(config.metadata_key.clone()))
        }
        RerankStrategy::Cohere => {
            let requirement = config
                .credential_requirement()
                .ok_or_else(|| ConfigError::missing_field("rerank.api_key_env"))?;
            let key = credentials.key_for(&requirement)?;
            Arc::new(CohereReranker::new(config, key, retry.clone())?)
        }
    };
    Ok(Some(reranker))
}


#[cfg(test)]
mod tests {
    use super::*;
    use ragweave_core::MockLlmProvider;

    #[test]
    fn test_strategy_tags() {
        assert_eq!("custom".parse::<RerankStrategy>().unwrap(), RerankStrategy::CrossEncoder);
        assert_eq!("llm-reranker".parse::<RerankStrategy>().unwrap(), RerankStrategy::Llm);
        let err = "colbert".parse::<RerankStrategy>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStrategy { .. }));
        let s: RerankStrategy = serde_json::from_str("\"cohere\"").unwrap();
        assert_eq!(s, RerankStrategy::Cohere);
    }

    #[test]
    fn test_no_strategy_builds_nothing() {
        let built = build_reranker(
            &RerankConfig::default(),
            None,
            None,
            &ResolvedCredentials::new(),
            &RetryConfig::none(),
        )
        .unwrap();
        assert!(built.is_none());
    }

    #[test]
    fn test_llm_strategy_requires_llm() {
        let config = RerankConfig {
            strategy: Some(RerankStrategy::Llm),
            ..Default::default()
        };
        let err = build_reranker(&config, None, None, &ResolvedCredentials::new(), &RetryConfig::none())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingDependency { .. }));

        let llm: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new());
        let built = build_reranker(&config, Some(llm), None, &ResolvedCredentials::new(), &RetryConfig::none())
            .unwrap()
            .unwrap();
        assert_eq!(built.name(), "llm-reranker");
    }

    #[test]
    fn test_cohere_requires_credential() {
        let config = RerankConfig {
            strategy: Some(RerankStrategy::Cohere),
            ..Default::default()
        };
        let err = build_reranker(&config, None, None, &ResolvedCredentials::new(), &RetryConfig::none())
            .err()
            .unwrap();
        match err {
            ConfigError::MissingCredential { var, .. } => assert_eq!(var, "COHERE_API_KEY"),
            other => panic!("Expected MissingCredential, got {:?}", other),
        }
    }

    #[test]
    fn test_cross_encoder_requires_endpoint() {
        let config = RerankConfig {
            strategy: Some(RerankStrategy::CrossEncoder),
            ..Default::default()
        };
        let err = build_reranker(&config, None, None, &ResolvedCredentials::new(), &RetryConfig::none())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn test_finish_sorts_and_truncates() {
        let nodes = test_support::scored(&[("a", "A", 0.1), ("b", "B", 0.9), ("c", "C", 0.5)]);
        let items = nodes
            .into_iter()
            .map(|s| (s.node.clone(), s.node.text.clone(), s.score))
            .collect();
        let out = finish(items, 2);
        let ids: Vec<&str> = out.iter().map(|r| r.node.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(out[1].rank, 1);
    }
}
