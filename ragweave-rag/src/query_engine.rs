//! Query answering over a retriever, with optional query transformation.
//!
//! The mode is fixed at construction:
//!
//! - `none`: retrieve, rerank, synthesize once.
//! - `hyde`: ask the LLM for a hypothetical answer passage first and embed it
//!   alongside the query, then proceed as `none`.
//! - `multi`: repeatedly ask the LLM for the next sub-question given the
//!   reasoning so far, answer each as `none`, and synthesize a final answer
//!   from the question/answer pairs. Stops when the LLM answers "None" or after
//!   `max_steps` sub-questions.
//!
//! Every mode needs an LLM, so the builder refuses to construct an engine
//! without one.

use crate::node::ScoredNode;
use crate::prompts::{HYDE_PROMPT, STEP_DECOMPOSE_PROMPT, TEXT_QA_PROMPT, render};
use crate::rerank::{RerankedNode, Reranker};
use crate::retriever::{QueryBundle, Retriever};
use chrono::{DateTime, Utc};
use ragweave_core::{ConfigError, LlmProvider, PipelineStage, RagError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Answer returned when nothing was retrieved.
pub const EMPTY_RESPONSE: &str = "Empty Response";

const DEFAULT_INDEX_SUMMARY: &str = "Used to answer questions about the indexed documents.";

/// Query transformation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryMode {
    #[default]
    #[serde(rename = "none", alias = "direct")]
    Direct,
    #[serde(rename = "hyde", alias = "hyDE")]
    Hyde,
    #[serde(rename = "multi", alias = "multi_step")]
    MultiStep,
}

impl std::fmt::Display for QueryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryMode::Direct => write!(f, "none"),
            QueryMode::Hyde => write!(f, "hyde"),
            QueryMode::MultiStep => write!(f, "multi"),
        }
    }
}

impl FromStr for QueryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "direct" => Ok(QueryMode::Direct),
            "hyde" => Ok(QueryMode::Hyde),
            "multi" | "multi_step" => Ok(QueryMode::MultiStep),
            _ => Err(ConfigError::unknown_strategy("query mode", s)),
        }
    }
}

/// A single step in the reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ReasoningStep {
    fn now(step: &str, detail: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Reference to a source node used for the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReference {
    pub document_id: String,
    pub chunk_id: String,
    pub relevance_score: f32,
    /// The text the answer was synthesized from.
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<&RerankedNode> for SourceReference {
    fn from(r: &RerankedNode) -> Self {
        Self {
            document_id: r.node.document_id.clone(),
            chunk_id: r.node.id.clone(),
            relevance_score: r.score,
            text: r.text.clone(),
            metadata: r.node.metadata.clone(),
        }
    }
}

/// Retrieval statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalStats {
    pub chunks_retrieved: usize,
    pub chunks_used: usize,
    pub avg_relevance_score: f32,
    pub retrieval_time_ms: u64,
}

/// Answer with source attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub answer: String,
    pub sources: Vec<SourceReference>,
    pub mode: QueryMode,
    pub reasoning_trace: Vec<ReasoningStep>,
    pub retrieval_stats: RetrievalStats,
}

impl Response {
    /// One `> Source (Doc id: ..): ..` line per source, text cut to `length` characters.
    pub fn formatted_sources(&self, length: usize) -> String {
        self.sources
            .iter()
            .map(|s| format!("> Source (Doc id: {}): {}", s.chunk_id, truncate_text(&s.text, length)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.answer)
    }
}

fn truncate_text(text: &str, length: usize) -> String {
    if text.chars().count() <= length {
        return text.to_string();
    }
    let kept: String = text.chars().take(length.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Result of one retrieve, rerank and synthesize pass.
struct Answered {
    answer: String,
    used: Vec<RerankedNode>,
    retrieved: usize,
    elapsed_ms: u64,
}

pub struct QueryEngineBuilder {
    retriever: Option<Arc<dyn Retriever>>,
    llm: Option<Arc<dyn LlmProvider>>,
    reranker: Option<Arc<dyn Reranker>>,
    top_n: usize,
    mode: QueryMode,
    max_steps: usize,
    include_original: bool,
    index_summary: String,
}

impl QueryEngineBuilder {
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Optional second pass; keeps at most `top_n` nodes.
    pub fn reranker(mut self, reranker: Arc<dyn Reranker>, top_n: usize) -> Self {
        self.reranker = Some(reranker);
        self.top_n = top_n;
        self
    }

    pub fn mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// HyDE: embed the original query alongside the hypothetical passage.
    pub fn include_original(mut self, include: bool) -> Self {
        self.include_original = include;
        self
    }

    /// Multi-step: description of the knowledge source shown to the decomposer.
    pub fn index_summary(mut self, summary: impl Into<String>) -> Self {
        self.index_summary = summary.into();
        self
    }

    pub fn build(self) -> Result<QueryEngine, ConfigError> {
        let component = match self.mode {
            QueryMode::Direct => "answer synthesis",
            QueryMode::Hyde => "hyde query mode",
            QueryMode::MultiStep => "multi-step query mode",
        };
        let llm = self
            .llm
            .ok_or_else(|| ConfigError::missing_dependency(component, "an LLM"))?;
        let retriever = self
            .retriever
            .ok_or_else(|| ConfigError::missing_dependency("query engine", "a retriever"))?;
        if self.mode == QueryMode::MultiStep && self.max_steps == 0 {
            return Err(ConfigError::invalid("query.max_steps must be at least 1"));
        }
        if self.reranker.is_some() && self.top_n == 0 {
            return Err(ConfigError::invalid("rerank.top_n must be greater than 0"));
        }
        Ok(QueryEngine {
            retriever,
            llm,
            reranker: self.reranker,
            top_n: self.top_n,
            mode: self.mode,
            max_steps: self.max_steps,
            include_original: self.include_original,
            index_summary: self.index_summary,
        })
    }
}

pub struct QueryEngine {
    retriever: Arc<dyn Retriever>,
    llm: Arc<dyn LlmProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    top_n: usize,
    mode: QueryMode,
    max_steps: usize,
    include_original: bool,
    index_summary: String,
}

impl QueryEngine {
    pub fn builder() -> QueryEngineBuilder {
        QueryEngineBuilder {
            retriever: None,
            llm: None,
            reranker: None,
            top_n: 3,
            mode: QueryMode::default(),
            max_steps: 3,
            include_original: true,
            index_summary: DEFAULT_INDEX_SUMMARY.to_string(),
        }
    }

    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    pub async fn query(&self, query: &str) -> Result<Response, RagError> {
        info!(mode = %self.mode, "Answering query");
        match self.mode {
            QueryMode::Direct => {
                let answered = self.answer(&QueryBundle::new(query)).await?;
                let trace = vec![ReasoningStep::now(
                    "retrieve",
                    format!("{} chunks used", answered.used.len()),
                )];
                Ok(self.respond(answered, trace))
            }
            QueryMode::Hyde => self.query_hyde(query).await,
            QueryMode::MultiStep => self.query_multi_step(query).await,
        }
    }

    async fn query_hyde(&self, query: &str) -> Result<Response, RagError> {
        let prompt = render(HYDE_PROMPT, &[("query_str", query)]);
        let passage = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| RagError::external(PipelineStage::Transform, e))?;
        debug!(chars = passage.len(), "Generated hypothetical document");

        let mut embedding_strs = vec![passage.clone()];
        if self.include_original {
            embedding_strs.push(query.to_string());
        }
        let bundle = QueryBundle::new(query).with_embedding_strs(embedding_strs);
        let answered = self.answer(&bundle).await?;
        let trace = vec![
            ReasoningStep::now("hyde", passage),
            ReasoningStep::now("retrieve", format!("{} chunks used", answered.used.len())),
        ];
        Ok(self.respond(answered, trace))
    }

    async fn query_multi_step(&self, query: &str) -> Result<Response, RagError> {
        let mut prev_reasoning = String::new();
        let mut qa_chunks: Vec<String> = Vec::new();
        let mut sources: Vec<RerankedNode> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut trace = Vec::new();
        let mut retrieved = 0;
        let mut elapsed_ms = 0;

        for step in 0..self.max_steps {
            let sub_question = self.decompose(query, &prev_reasoning).await?;
            if sub_question.to_lowercase().contains("none") {
                debug!(step = step, "Decomposition signalled stop");
                trace.push(ReasoningStep::now("stop", sub_question));
                break;
            }
            debug!(step = step, question = %sub_question, "Answering sub-question");
            let answered = self.answer(&QueryBundle::new(sub_question.clone())).await?;
            qa_chunks.push(format!("\nQuestion: {}\nAnswer: {}", sub_question, answered.answer));
            prev_reasoning.push_str(&format!("- {}\n- {}\n", sub_question, answered.answer));
            trace.push(ReasoningStep::now(
                "sub_question",
                format!("{} => {}", sub_question, answered.answer),
            ));
            retrieved += answered.retrieved;
            elapsed_ms += answered.elapsed_ms;
            for node in answered.used {
                if seen.insert(node.node.id.clone()) {
                    sources.push(node);
                }
            }
        }

        if qa_chunks.is_empty() {
            info!("No sub-questions produced; answering the query directly");
            let answered = self.answer(&QueryBundle::new(query)).await?;
            trace.push(ReasoningStep::now(
                "retrieve",
                format!("{} chunks used", answered.used.len()),
            ));
            return Ok(self.respond(answered, trace));
        }

        let answer = self.synthesize(query, &qa_chunks).await?;
        trace.push(ReasoningStep::now("synthesize", format!("{} steps", qa_chunks.len())));
        Ok(self.respond(
            Answered {
                answer,
                used: sources,
                retrieved,
                elapsed_ms,
            },
            trace,
        ))
    }

    async fn decompose(&self, query: &str, prev_reasoning: &str) -> Result<String, RagError> {
        let prompt = render(
            STEP_DECOMPOSE_PROMPT,
            &[
                ("query_str", query),
                ("context_str", self.index_summary.as_str()),
                ("prev_reasoning", prev_reasoning),
            ],
        );
        let text = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| RagError::external(PipelineStage::Transform, e))?;
        Ok(text.trim().to_string())
    }

    /// Retrieve, rerank and synthesize for one query bundle.
    async fn answer(&self, bundle: &QueryBundle) -> Result<Answered, RagError> {
        let started = Instant::now();
        let candidates = self.retriever.retrieve(bundle).await?;
        let retrieved = candidates.len();
        let fused = ScoredNode::ranked(candidates.into_iter().map(|c| (c.node, c.score)).collect());
        let used = match &self.reranker {
            Some(reranker) => reranker.rerank(&bundle.query_str, fused, self.top_n).await?,
            None => fused.into_iter().map(RerankedNode::from_scored).collect(),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if used.is_empty() {
            warn!(query = %bundle.query_str, "Nothing retrieved for query");
            return Ok(Answered {
                answer: EMPTY_RESPONSE.to_string(),
                used,
                retrieved,
                elapsed_ms,
            });
        }
        let texts: Vec<String> = used.iter().map(|r| r.text.clone()).collect();
        let answer = self.synthesize(&bundle.query_str, &texts).await?;
        Ok(Answered {
            answer,
            used,
            retrieved,
            elapsed_ms,
        })
    }

    async fn synthesize(&self, query: &str, chunks: &[String]) -> Result<String, RagError> {
        let context = chunks.join("\n\n");
        let prompt = render(
            TEXT_QA_PROMPT,
            &[("context_str", context.as_str()), ("query_str", query)],
        );
        let answer = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| RagError::external(PipelineStage::Synthesis, e))?;
        Ok(answer.trim().to_string())
    }

    fn respond(&self, answered: Answered, reasoning_trace: Vec<ReasoningStep>) -> Response {
        let sources: Vec<SourceReference> = answered.used.iter().map(SourceReference::from).collect();
        let avg_relevance_score = if sources.is_empty() {
            0.0
        } else {
            sources.iter().map(|s| s.relevance_score).sum::<f32>() / sources.len() as f32
        };
        Response {
            answer: answered.answer,
            retrieval_stats: RetrievalStats {
                chunks_retrieved: answered.retrieved,
                chunks_used: sources.len(),
                avg_relevance_score,
                retrieval_time_ms: answered.elapsed_ms,
            },
            sources,
            mode: self.mode,
            reasoning_trace,
        }
    }
}
