//! Metadata replacement: swap each node's text for a stored metadata entry.
//!
//! Paired with window chunking this hands the answer step the surrounding
//! sentences instead of the single matched sentence. Order and scores are
//! left as fused.

use super::{RerankedNode, Reranker};
use crate::node::ScoredNode;
use async_trait::async_trait;
use ragweave_core::RagError;
use tracing::warn;

pub struct MetadataReplacementReranker {
    key: String,
}

impl MetadataReplacementReranker {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Reranker for MetadataReplacementReranker {
    fn name(&self) -> &str {
        "metadata"
    }

    async fn rerank(
        &self,
        _query: &str,
        candidates: Vec<ScoredNode>,
        top_n: usize,
    ) -> Result<Vec<RerankedNode>, RagError> {
        let mut replaced = 0;
        let out: Vec<RerankedNode> = candidates
            .into_iter()
            .take(top_n)
            .enumerate()
            .map(|(rank, c)| {
                let text = match c.node.metadata.get(&self.key) {
                    Some(value) => {
                        replaced += 1;
                        value.clone()
                    }
                    None => c.node.text.clone(),
                };
                RerankedNode {
                    node: c.node,
                    text,
                    score: c.score,
                    rank,
                }
            })
            .collect();
        if replaced == 0 && !out.is_empty() {
            warn!(
                key = %self.key,
                "No candidate carries the replacement metadata; is window chunking enabled?"
            );
        }
        Ok(out)
    }
}
