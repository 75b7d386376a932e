//! Nodes (chunks) and the scored wrappers that flow through retrieval.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata key holding the surrounding sentence window.
pub const WINDOW_KEY: &str = "window";
/// Metadata key holding the single sentence a window node was built around.
pub const ORIGINAL_TEXT_KEY: &str = "original_sentence";

/// Position of a node inside a hierarchical split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    /// 0 is the coarsest level.
    pub level: usize,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
}

/// A slice of one document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub document_id: String,
    pub text: String,
    /// Byte offsets of `text` within the source document.
    pub start_offset: usize,
    pub end_offset: usize,
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy: Option<Hierarchy>,
}

impl Node {
    /// Leaves are the nodes that get embedded and searched.
    pub fn is_leaf(&self) -> bool {
        self.hierarchy
            .as_ref()
            .map(|h| h.child_ids.is_empty())
            .unwrap_or(true)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.hierarchy.as_ref().and_then(|h| h.parent_id.as_deref())
    }
}

/// A node produced by one retrieval strategy, with its strategy-specific score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: Arc<Node>,
    pub score: f32,
    /// Name of the retriever that produced it.
    pub source: String,
}

/// A node with a fused score and a dense rank starting at 0.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Arc<Node>,
    pub score: f32,
    pub rank: usize,
}

impl ScoredNode {
    /// Re-rank a score-ordered list densely from 0.
    pub fn ranked(items: Vec<(Arc<Node>, f32)>) -> Vec<ScoredNode> {
        items
            .into_iter()
            .enumerate()
            .map(|(rank, (node, score))| ScoredNode { node, score, rank })
            .collect()
    }
}
