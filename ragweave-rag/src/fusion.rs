//! Fusion of several retrieval strategies into one ranked list.
//!
//! Each strategy's scores live on their own scale (BM25 is unbounded, vector
//! similarity is in (0, 1]), so every result set is normalized on its own
//! before weighting. Nodes returned by several strategies are unioned by id
//! and their weighted contributions summed; a strategy that did not return a
//! node simply contributes nothing to it.

use crate::node::{Candidate, Node, ScoredNode};
use crate::prompts::{QUERY_GEN_PROMPT, render};
use crate::retriever::{QueryBundle, Retriever};
use async_trait::async_trait;
use futures::future::try_join_all;
use ragweave_core::{ConfigError, LlmProvider, PipelineStage, RagError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Constant of reciprocal rank fusion.
pub const RRF_K: f32 = 60.0;

/// How per-strategy scores are normalized before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Min-max scaling over each result set.
    #[default]
    RelativeScore,
    /// Scaling over mean ± 3 standard deviations, clamped to [0, 1].
    DistBasedScore,
    /// `1 / (RRF_K + rank)` with ranks from 1, ignoring raw scores.
    ReciprocalRank,
}

impl std::fmt::Display for FusionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FusionMode::RelativeScore => write!(f, "relative_score"),
            FusionMode::DistBasedScore => write!(f, "dist_based_score"),
            FusionMode::ReciprocalRank => write!(f, "reciprocal_rank"),
        }
    }
}

impl FromStr for FusionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relative_score" => Ok(FusionMode::RelativeScore),
            "dist_based_score" => Ok(FusionMode::DistBasedScore),
            "reciprocal_rank" | "rrf" => Ok(FusionMode::ReciprocalRank),
            other => Err(ConfigError::unknown_strategy("fusion", other)),
        }
    }
}

/// One strategy's result set for one query variant, with its effective weight.
#[derive(Debug, Clone)]
pub struct WeightedList {
    pub weight: f32,
    pub candidates: Vec<Candidate>,
}

fn finite_scores(candidates: &[Candidate]) -> Vec<f32> {
    candidates
        .iter()
        .map(|c| {
            if c.score.is_finite() {
                c.score
            } else {
                warn!(node_id = %c.node.id, source = %c.source, "Non-finite retrieval score treated as 0");
                0.0
            }
        })
        .collect()
}

fn scale(scores: &[f32], lo: f32, hi: f32) -> Vec<f32> {
    scores
        .iter()
        .map(|&s| {
            if hi == lo {
                if hi > 0.0 { 1.0 } else { 0.0 }
            } else {
                ((s - lo) / (hi - lo)).clamp(0.0, 1.0)
            }
        })
        .collect()
}

/// Normalize one result set into [0, 1] according to `mode`.
pub fn normalize(candidates: &[Candidate], mode: FusionMode) -> Vec<f32> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let scores = finite_scores(candidates);
    match mode {
        FusionMode::RelativeScore => {
            let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            scale(&scores, min, max)
        }
        FusionMode::DistBasedScore => {
            let n = scores.len() as f32;
            let mean = scores.iter().sum::<f32>() / n;
            let std = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n).sqrt();
            scale(&scores, mean - 3.0 * std, mean + 3.0 * std)
        }
        FusionMode::ReciprocalRank => (0..scores.len())
            .map(|rank| 1.0 / (RRF_K + rank as f32 + 1.0))
            .collect(),
    }
}

/// Fuse weighted result sets into at most `top_k` densely ranked nodes.
///
/// Ties keep first-seen order: list order first, then rank within the list.
pub fn fuse(lists: &[WeightedList], mode: FusionMode, top_k: usize) -> Vec<ScoredNode> {
    let mut merged: Vec<(Arc<Node>, f32)> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();

    for list in lists {
        let normalized = normalize(&list.candidates, mode);
        for (candidate, score) in list.candidates.iter().zip(normalized) {
            let contribution = score * list.weight;
            match position.get(candidate.node.id.as_str()) {
                Some(&i) => merged[i].1 += contribution,
                None => {
                    position.insert(candidate.node.id.as_str(), merged.len());
                    merged.push((candidate.node.clone(), contribution));
                }
            }
        }
    }

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    ScoredNode::ranked(merged)
}

/// Weighted fusion over several retrievers, optionally with LLM-generated query variants.
pub struct FusionRetriever {
    retrievers: Vec<Arc<dyn Retriever>>,
    weights: Vec<f32>,
    top_k: usize,
    mode: FusionMode,
    num_queries: usize,
    llm: Option<Arc<dyn LlmProvider>>,
}

impl std::fmt::Debug for FusionRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionRetriever")
            .field(
                "retrievers",
                &self.retrievers.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .field("weights", &self.weights)
            .field("top_k", &self.top_k)
            .field("mode", &self.mode)
            .field("num_queries", &self.num_queries)
            .finish()
    }
}

pub struct FusionRetrieverBuilder {
    retrievers: Vec<Arc<dyn Retriever>>,
    weights: Option<Vec<f32>>,
    top_k: usize,
    mode: FusionMode,
    num_queries: usize,
    llm: Option<Arc<dyn LlmProvider>>,
}

impl FusionRetrieverBuilder {
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retrievers.push(retriever);
        self
    }

    pub fn retrievers(mut self, retrievers: Vec<Arc<dyn Retriever>>) -> Self {
        self.retrievers = retrievers;
        self
    }

    /// One weight per retriever, in registration order. Defaults to equal weights.
    pub fn weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn mode(mut self, mode: FusionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Total queries per retriever, the original included.
    pub fn num_queries(mut self, num_queries: usize) -> Self {
        self.num_queries = num_queries;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn build(self) -> Result<FusionRetriever, ConfigError> {
        if self.retrievers.is_empty() {
            return Err(ConfigError::invalid(
                "fusion requires at least one retrieval strategy",
            ));
        }
        let weights = self
            .weights
            .unwrap_or_else(|| vec![1.0; self.retrievers.len()]);
        if weights.len() != self.retrievers.len() {
            return Err(ConfigError::invalid(format!(
                "{} weights given for {} retrieval strategies",
                weights.len(),
                self.retrievers.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid(
                "fusion weights must be finite and non-negative",
            ));
        }
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            return Err(ConfigError::invalid("fusion weights must not all be zero"));
        }
        if self.top_k == 0 {
            return Err(ConfigError::invalid("fusion top_k must be greater than 0"));
        }
        if self.num_queries == 0 {
            return Err(ConfigError::invalid(
                "retrieval.num_queries must be at least 1",
            ));
        }
        if self.num_queries > 1 && self.llm.is_none() {
            return Err(ConfigError::missing_dependency(
                "query generation (num_queries > 1)",
                "an LLM",
            ));
        }

        Ok(FusionRetriever {
            retrievers: self.retrievers,
            weights: weights.iter().map(|w| w / total).collect(),
            top_k: self.top_k,
            mode: self.mode,
            num_queries: self.num_queries,
            llm: self.llm,
        })
    }
}

impl FusionRetriever {
    pub fn builder() -> FusionRetrieverBuilder {
        FusionRetrieverBuilder {
            retrievers: Vec::new(),
            weights: None,
            top_k: 5,
            mode: FusionMode::default(),
            num_queries: 1,
            llm: None,
        }
    }

    /// Normalized weights, one per retriever.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// The original query followed by up to `num_queries - 1` generated variants.
    async fn query_variants(&self, query: &QueryBundle) -> Result<Vec<QueryBundle>, RagError> {
        let mut bundles = vec![query.clone()];
        let Some(llm) = self.llm.as_ref().filter(|_| self.num_queries > 1) else {
            return Ok(bundles);
        };
        let wanted = self.num_queries - 1;
        let count = wanted.to_string();
        let prompt = render(
            QUERY_GEN_PROMPT,
            &[
                ("num_queries", count.as_str()),
                ("query_str", query.query_str.as_str()),
            ],
        );
        let text = llm
            .generate(&prompt)
            .await
            .map_err(|e| RagError::external(PipelineStage::Transform, e))?;
        let variants: Vec<String> = text
            .lines()
            .map(strip_list_marker)
            .filter(|l| !l.is_empty() && *l != query.query_str)
            .take(wanted)
            .map(str::to_string)
            .collect();
        if variants.len() < wanted {
            warn!(
                wanted = wanted,
                generated = variants.len(),
                "LLM produced fewer query variants than requested"
            );
        }
        debug!(variants = ?variants, "Generated query variants");
        bundles.extend(variants.into_iter().map(QueryBundle::new));
        Ok(bundles)
    }

    /// Query every (retriever, query variant) pair concurrently and fuse the results.
    pub async fn retrieve_fused(&self, query: &QueryBundle) -> Result<Vec<ScoredNode>, RagError> {
        let bundles = self.query_variants(query).await?;
        let per_query = 1.0 / bundles.len() as f32;

        let mut jobs = Vec::with_capacity(self.retrievers.len() * bundles.len());
        let mut weights = Vec::with_capacity(jobs.capacity());
        for (retriever, weight) in self.retrievers.iter().zip(&self.weights) {
            for bundle in &bundles {
                jobs.push(retriever.retrieve(bundle));
                weights.push(weight * per_query);
            }
        }
        let results = try_join_all(jobs).await?;

        let lists: Vec<WeightedList> = weights
            .into_iter()
            .zip(results)
            .map(|(weight, candidates)| WeightedList { weight, candidates })
            .collect();
        let fused = fuse(&lists, self.mode, self.top_k);
        debug!(
            mode = %self.mode,
            lists = lists.len(),
            fused = fused.len(),
            "Fused retrieval results"
        );
        Ok(fused)
    }
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    // Digits only form a marker when `.` or `)` and then whitespace follow them.
    let rest = match line[digits..].strip_prefix(['.', ')']) {
        Some(rest) if digits > 0 && (rest.is_empty() || rest.starts_with(char::is_whitespace)) => {
            rest
        }
        _ => line.trim_start_matches(['-', '*']),
    };
    rest.trim()
}

#[async_trait]
impl Retriever for FusionRetriever {
    fn name(&self) -> &str {
        "fusion"
    }

    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Candidate>, RagError> {
        Ok(self
            .retrieve_fused(query)
            .await?
            .into_iter()
            .map(|s| Candidate {
                node: s.node,
                score: s.score,
                source: "fusion".to_string(),
            })
            .collect())
    }
}
