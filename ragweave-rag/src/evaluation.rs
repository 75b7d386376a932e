//! Evaluation test sets and retrieval metrics.
//!
//! A generator LLM writes question / ground-truth pairs from indexed nodes
//! and a critic LLM filters out weak ones. Questions come in three
//! evolutions: `simple` (one fact), `reasoning` (several statements of one
//! node) and `multi_context` (neighbouring nodes of one document).

use crate::chunk::nodes_by_document;
use crate::node::Node;
use crate::prompts::{
    MULTI_CONTEXT_STYLE, REASONING_STYLE, SIMPLE_STYLE, TESTSET_CRITIC_PROMPT,
    TESTSET_QUESTION_PROMPT, render,
};
use crate::retriever::{QueryBundle, Retriever};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use ragweave_core::{ConfigError, LlmProvider, PipelineStage, RagError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Question style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evolution {
    Simple,
    Reasoning,
    MultiContext,
}

impl Evolution {
    fn style(&self) -> &'static str {
        match self {
            Evolution::Simple => SIMPLE_STYLE,
            Evolution::Reasoning => REASONING_STYLE,
            Evolution::MultiContext => MULTI_CONTEXT_STYLE,
        }
    }
}

impl std::fmt::Display for Evolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Evolution::Simple => write!(f, "simple"),
            Evolution::Reasoning => write!(f, "reasoning"),
            Evolution::MultiContext => write!(f, "multi_context"),
        }
    }
}

/// Relative share of each evolution. Need not sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Distribution {
    pub simple: f32,
    pub reasoning: f32,
    pub multi_context: f32,
}

impl Default for Distribution {
    fn default() -> Self {
        Self {
            simple: 0.5,
            reasoning: 0.25,
            multi_context: 0.25,
        }
    }
}

impl Distribution {
    fn shares(&self) -> [(Evolution, f32); 3] {
        [
            (Evolution::Simple, self.simple),
            (Evolution::Reasoning, self.reasoning),
            (Evolution::MultiContext, self.multi_context),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let shares = self.shares();
        if shares.iter().any(|(_, s)| !s.is_finite() || *s < 0.0) {
            return Err(ConfigError::invalid(
                "testset distribution shares must be finite and non-negative",
            ));
        }
        if shares.iter().map(|(_, s)| s).sum::<f32>() <= 0.0 {
            return Err(ConfigError::invalid(
                "testset distribution shares must not all be zero",
            ));
        }
        Ok(())
    }

    /// Split `total` samples across evolutions by largest remainder.
    pub fn counts(&self, total: usize) -> Vec<(Evolution, usize)> {
        let shares = self.shares();
        let sum: f32 = shares.iter().map(|(_, s)| s).sum();
        if sum <= 0.0 {
            return Vec::new();
        }
        let exact: Vec<f32> = shares
            .iter()
            .map(|(_, s)| s / sum * total as f32)
            .collect();
        let mut counts: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();
        let mut order: Vec<usize> = (0..shares.len()).collect();
        order.sort_by(|&a, &b| {
            let ra = exact[a] - exact[a].floor();
            let rb = exact[b] - exact[b].floor();
            rb.total_cmp(&ra)
        });
        let assigned: usize = counts.iter().sum();
        for &i in order.iter().take(total.saturating_sub(assigned)) {
            counts[i] += 1;
        }
        shares
            .iter()
            .zip(counts)
            .map(|((evolution, _), n)| (*evolution, n))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestsetConfig {
    pub test_size: usize,
    pub distribution: Distribution,
    /// Minimum critic score (1-10) a question needs to be kept.
    pub critic_threshold: f32,
    /// Generation attempts per sample before giving up on it.
    pub max_attempts: usize,
    /// Nodes combined into one multi-context sample.
    pub multi_context_nodes: usize,
    pub seed: Option<u64>,
}

impl Default for TestsetConfig {
    fn default() -> Self {
        Self {
            test_size: 5,
            distribution: Distribution::default(),
            critic_threshold: 6.0,
            max_attempts: 3,
            multi_context_nodes: 2,
            seed: None,
        }
    }
}

/// One generated evaluation sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSample {
    pub id: String,
    pub question: String,
    pub ground_truth: String,
    pub contexts: Vec<String>,
    pub node_ids: Vec<String>,
    pub document_ids: Vec<String>,
    pub evolution: Evolution,
    pub critic_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testset {
    pub generated_at: DateTime<Utc>,
    pub samples: Vec<TestSample>,
}

impl Testset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub async fn save(&self, path: &Path) -> Result<(), RagError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, RagError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RagError::NotFound {
                path: path.to_path_buf(),
            },
            _ => RagError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Deserialize)]
struct GeneratedQuestion {
    question: String,
    ground_truth: String,
}

#[derive(Debug, Deserialize)]
struct CriticVerdict {
    score: f32,
    #[serde(default)]
    reason: String,
}

/// Parse the first JSON object in an LLM answer, ignoring code fences and prose.
fn parse_json_object<T: DeserializeOwned>(answer: &str) -> Option<T> {
    let start = answer.find('{')?;
    let end = answer.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&answer[start..=end]).ok()
}

pub struct TestsetGenerator {
    generator: Arc<dyn LlmProvider>,
    critic: Arc<dyn LlmProvider>,
    config: TestsetConfig,
}

impl TestsetGenerator {
    pub fn new(
        generator: Arc<dyn LlmProvider>,
        critic: Arc<dyn LlmProvider>,
        config: TestsetConfig,
    ) -> Result<Self, ConfigError> {
        config.distribution.validate()?;
        if config.max_attempts == 0 {
            return Err(ConfigError::invalid("testset max_attempts must be at least 1"));
        }
        if config.multi_context_nodes < 2 {
            return Err(ConfigError::invalid(
                "testset multi_context_nodes must be at least 2",
            ));
        }
        Ok(Self {
            generator,
            critic,
            config,
        })
    }

    /// Generate up to `test_size` samples from the leaf nodes in `nodes`.
    ///
    /// Samples the critic keeps rejecting are skipped with a warning, so the
    /// result can be shorter than requested.
    pub async fn generate(&self, nodes: &[Arc<Node>]) -> Result<Testset, RagError> {
        let leaves: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|n| n.is_leaf() && !n.text.trim().is_empty())
            .cloned()
            .collect();
        if leaves.is_empty() {
            return Err(ConfigError::invalid("no indexed text to generate questions from").into());
        }
        let groups: Vec<Vec<Arc<Node>>> = nodes_by_document(&leaves)
            .into_values()
            .filter(|group| group.len() >= 2)
            .map(|group| group.into_iter().cloned().collect())
            .collect();

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut plan: Vec<Evolution> = Vec::with_capacity(self.config.test_size);
        for (evolution, count) in self.config.distribution.counts(self.config.test_size) {
            let evolution = if evolution == Evolution::MultiContext && groups.is_empty() {
                if count > 0 {
                    warn!(
                        count = count,
                        "No document has two nodes; generating reasoning questions instead of multi-context ones"
                    );
                }
                Evolution::Reasoning
            } else {
                evolution
            };
            plan.extend(std::iter::repeat_n(evolution, count));
        }
        plan.shuffle(&mut rng);

        let mut samples = Vec::with_capacity(plan.len());
        for evolution in plan {
            let mut kept = None;
            for attempt in 1..=self.config.max_attempts {
                let contexts = self.pick_contexts(evolution, &leaves, &groups, &mut rng);
                if let Some(sample) = self.attempt(evolution, &contexts).await? {
                    kept = Some(sample);
                    break;
                }
                debug!(evolution = %evolution, attempt = attempt, "Sample rejected");
            }
            match kept {
                Some(sample) => samples.push(sample),
                None => warn!(
                    evolution = %evolution,
                    attempts = self.config.max_attempts,
                    "Giving up on a sample after repeated rejections"
                ),
            }
        }

        info!(
            requested = self.config.test_size,
            generated = samples.len(),
            "Generated testset"
        );
        Ok(Testset {
            generated_at: Utc::now(),
            samples,
        })
    }

    fn pick_contexts(
        &self,
        evolution: Evolution,
        leaves: &[Arc<Node>],
        groups: &[Vec<Arc<Node>>],
        rng: &mut StdRng,
    ) -> Vec<Arc<Node>> {
        if evolution == Evolution::MultiContext
            && let Some(group) = groups.choose(rng)
        {
            // Consecutive nodes of one document.
            let span = self.config.multi_context_nodes.min(group.len());
            let start = rng.gen_range(0..=group.len() - span);
            return group[start..start + span].to_vec();
        }
        leaves.choose(rng).cloned().into_iter().collect()
    }

    /// One generate-then-critique round. `None` when the sample is rejected.
    async fn attempt(
        &self,
        evolution: Evolution,
        contexts: &[Arc<Node>],
    ) -> Result<Option<TestSample>, RagError> {
        let context_str = contexts
            .iter()
            .map(|n| n.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = render(
            TESTSET_QUESTION_PROMPT,
            &[("style", evolution.style()), ("context_str", context_str.as_str())],
        );
        let answer = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| RagError::external(PipelineStage::Evaluation, e))?;
        let Some(generated) = parse_json_object::<GeneratedQuestion>(&answer) else {
            warn!(evolution = %evolution, "Generator answer was not the expected JSON");
            return Ok(None);
        };
        if generated.question.trim().is_empty() {
            return Ok(None);
        }

        let prompt = render(
            TESTSET_CRITIC_PROMPT,
            &[
                ("context_str", context_str.as_str()),
                ("question", generated.question.as_str()),
            ],
        );
        let verdict = self
            .critic
            .generate(&prompt)
            .await
            .map_err(|e| RagError::external(PipelineStage::Evaluation, e))?;
        let Some(verdict) = parse_json_object::<CriticVerdict>(&verdict) else {
            warn!(evolution = %evolution, "Critic answer was not the expected JSON");
            return Ok(None);
        };
        if verdict.score < self.config.critic_threshold {
            debug!(score = verdict.score, reason = %verdict.reason, "Critic rejected question");
            return Ok(None);
        }

        let mut document_ids: Vec<String> = Vec::new();
        for node in contexts {
            if !document_ids.contains(&node.document_id) {
                document_ids.push(node.document_id.clone());
            }
        }
        Ok(Some(TestSample {
            id: uuid::Uuid::new_v4().to_string(),
            question: generated.question.trim().to_string(),
            ground_truth: generated.ground_truth.trim().to_string(),
            contexts: contexts.iter().map(|n| n.text.clone()).collect(),
            node_ids: contexts.iter().map(|n| n.id.clone()).collect(),
            document_ids,
            evolution,
            critic_score: verdict.score,
        }))
    }
}

/// What counts as a relevant retrieval hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceKey {
    /// The exact node the question was generated from.
    #[default]
    Node,
    /// Any node of the same document; survives re-chunking.
    Document,
}

/// Aggregate retrieval metrics over a testset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub hit_rate: f64,
    pub mrr: f64,
    pub precision: f64,
    pub recall: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEvalResult {
    pub query: String,
    pub retrieved_relevant: usize,
    pub total_retrieved: usize,
    pub precision: f64,
    pub recall: f64,
    pub reciprocal_rank: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalEvalResult {
    pub test_cases_run: usize,
    pub metrics: RetrievalMetrics,
    pub per_query_results: Vec<QueryEvalResult>,
}

/// Run every testset question through `retriever` and score the hits.
pub async fn evaluate_retrieval(
    retriever: &dyn Retriever,
    testset: &Testset,
    key: RelevanceKey,
) -> Result<RetrievalEvalResult, RagError> {
    let mut per_query = Vec::with_capacity(testset.len());
    for sample in &testset.samples {
        let relevant: HashSet<&str> = match key {
            RelevanceKey::Node => sample.node_ids.iter().map(String::as_str).collect(),
            RelevanceKey::Document => sample.document_ids.iter().map(String::as_str).collect(),
        };
        let candidates = retriever.retrieve(&QueryBundle::new(&sample.question)).await?;

        let mut found: HashSet<&str> = HashSet::new();
        let mut first_hit = None;
        let mut retrieved_relevant = 0;
        for (rank, candidate) in candidates.iter().enumerate() {
            let id = match key {
                RelevanceKey::Node => candidate.node.id.as_str(),
                RelevanceKey::Document => candidate.node.document_id.as_str(),
            };
            if relevant.contains(id) {
                retrieved_relevant += 1;
                found.insert(id);
                first_hit.get_or_insert(rank);
            }
        }

        per_query.push(QueryEvalResult {
            query: sample.question.clone(),
            retrieved_relevant,
            total_retrieved: candidates.len(),
            precision: ratio(retrieved_relevant, candidates.len()),
            recall: ratio(found.len(), relevant.len()),
            reciprocal_rank: first_hit.map(|r| 1.0 / (r + 1) as f64).unwrap_or(0.0),
        });
    }

    let n = per_query.len();
    let mean = |f: fn(&QueryEvalResult) -> f64| {
        if n == 0 {
            0.0
        } else {
            per_query.iter().map(f).sum::<f64>() / n as f64
        }
    };
    let metrics = RetrievalMetrics {
        hit_rate: mean(|q| if q.retrieved_relevant > 0 { 1.0 } else { 0.0 }),
        mrr: mean(|q| q.reciprocal_rank),
        precision: mean(|q| q.precision),
        recall: mean(|q| q.recall),
    };
    info!(
        queries = n,
        hit_rate = metrics.hit_rate,
        mrr = metrics.mrr,
        "Evaluated retrieval"
    );
    Ok(RetrievalEvalResult {
        test_cases_run: n,
        metrics,
        per_query_results: per_query,
    })
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
