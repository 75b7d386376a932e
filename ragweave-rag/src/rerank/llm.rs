//! LLM-judged reranking.
//!
//! Candidates are shown to the model in numbered batches; it answers with
//! `Doc: <n>, Relevance: <score>` lines. Documents it leaves out are dropped.

use super::{RerankedNode, Reranker, finish};
use crate::node::{Node, ScoredNode};
use crate::prompts::{CHOICE_SELECT_PROMPT, render};
use async_trait::async_trait;
use ragweave_core::{ConfigError, LlmProvider, PipelineStage, RagError};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static CHOICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)doc(?:ument)?\s*:?\s*(\d+)\s*,\s*relevance\s*:?\s*(\d+(?:\.\d+)?)")
        .unwrap_or_else(|e| panic!("invalid choice regex: {}", e))
});

pub struct LlmReranker {
    llm: Arc<dyn LlmProvider>,
    batch_size: usize,
}

impl LlmReranker {
    pub fn new(llm: Arc<dyn LlmProvider>, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::invalid(
                "rerank.choice_batch_size must be greater than 0",
            ));
        }
        Ok(Self { llm, batch_size })
    }
}

/// Parse `(document number, relevance)` pairs, 1-based, first mention wins.
pub fn parse_choices(answer: &str, batch_len: usize) -> Vec<(usize, f32)> {
    let mut seen = HashSet::new();
    let mut choices = Vec::new();
    for caps in CHOICE_LINE.captures_iter(answer) {
        let (Ok(number), Ok(relevance)) = (caps[1].parse::<usize>(), caps[2].parse::<f32>()) else {
            continue;
        };
        if number == 0 || number > batch_len {
            warn!(number = number, batch = batch_len, "LLM reranker cited a document outside the batch");
            continue;
        }
        if seen.insert(number) {
            choices.push((number, relevance));
        }
    }
    choices
}

fn format_batch(batch: &[ScoredNode]) -> String {
    batch
        .iter()
        .enumerate()
        .map(|(i, c)| format!("Document {}:\n{}", i + 1, c.node.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Reranker for LlmReranker {
    fn name(&self) -> &str {
        "llm-reranker"
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
        let mut items: Vec<(Arc<Node>, String, f32)> = Vec::new();
        for batch in candidates.chunks(self.batch_size) {
            let context = format_batch(batch);
            let prompt = render(
                CHOICE_SELECT_PROMPT,
                &[("context_str", context.as_str()), ("query_str", query)],
            );
            let answer = self
                .llm
                .generate(&prompt)
                .await
                .map_err(|e| RagError::external(PipelineStage::Rerank, e))?;
            let choices = parse_choices(&answer, batch.len());
            if choices.is_empty() {
                warn!(batch = batch.len(), "LLM reranker judged no document in the batch relevant");
            }
            for (number, relevance) in choices {
                let node = batch[number - 1].node.clone();
                items.push((node.clone(), node.text.clone(), relevance));
            }
        }
        debug!(kept = items.len(), candidates = candidates.len(), "LLM reranked candidates");
        Ok(finish(items, top_n))
    }
}
