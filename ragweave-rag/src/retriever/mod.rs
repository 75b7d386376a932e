//! Retrieval strategies.
//!
//! Every strategy implements [`Retriever`]: given a query it returns candidates
//! ordered best first, deterministically for a fixed index and query.

pub mod auto_merge;
pub mod bm25;
pub mod vector;

use crate::index::IndexStore;
use crate::node::Candidate;
use async_trait::async_trait;
use ragweave_core::{ConfigError, Embedder, RagError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

pub use auto_merge::AutoMergeRetriever;
pub use bm25::Bm25Retriever;
pub use vector::VectorRetriever;

/// Default candidates per strategy.
pub const DEFAULT_STRATEGY_TOP_K: usize = 2;

/// A query plus the strings dense retrieval should embed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBundle {
    pub query_str: String,
    /// Embedded and averaged by vector retrieval. Never empty.
    pub embedding_strs: Vec<String>,
}

impl QueryBundle {
    pub fn new(query: impl Into<String>) -> Self {
        let query_str = query.into();
        Self {
            embedding_strs: vec![query_str.clone()],
            query_str,
        }
    }

    /// Replace what gets embedded; an empty list falls back to the query itself.
    pub fn with_embedding_strs(mut self, strs: Vec<String>) -> Self {
        if !strs.is_empty() {
            self.embedding_strs = strs;
        }
        self
    }
}

/// A candidate producer.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Short name, recorded as the candidates' source.
    fn name(&self) -> &str;

    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Candidate>, RagError>;
}

/// Tag selecting a retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalMethod {
    #[serde(rename = "vector")]
    Vector,
    #[serde(rename = "bm25", alias = "BM25")]
    Bm25,
    #[serde(rename = "automerge", alias = "auto_merge")]
    AutoMerge,
}

impl std::fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalMethod::Vector => write!(f, "vector"),
            RetrievalMethod::Bm25 => write!(f, "bm25"),
            RetrievalMethod::AutoMerge => write!(f, "automerge"),
        }
    }
}

impl FromStr for RetrievalMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vector" => Ok(RetrievalMethod::Vector),
            "bm25" => Ok(RetrievalMethod::Bm25),
            "automerge" | "auto_merge" => Ok(RetrievalMethod::AutoMerge),
            _ => Err(ConfigError::unknown_strategy("retrieval", s)),
        }
    }
}

/// The single dispatch point from a method tag to a retriever.
pub fn build_retriever(
    method: RetrievalMethod,
    top_k: usize,
    store: &IndexStore,
    embedder: Arc<dyn Embedder>,
    merge_ratio: f32,
) -> Result<Arc<dyn Retriever>, RagError> {
    if top_k == 0 {
        return Err(ConfigError::invalid(format!("{} retriever top_k must be greater than 0", method)).into());
    }
    let retriever: Arc<dyn Retriever> = match method {
        RetrievalMethod::Vector => Arc::new(VectorRetriever::new(
            store.index.clone(),
            store.docstore.clone(),
            embedder,
            top_k,
        )),
        RetrievalMethod::Bm25 => Arc::new(Bm25Retriever::new(store.docstore.clone(), top_k)?),
        RetrievalMethod::AutoMerge => {
            let base = VectorRetriever::new(
                store.index.clone(),
                store.docstore.clone(),
                embedder,
                top_k,
            );
            Arc::new(AutoMergeRetriever::new(
                base,
                store.docstore.clone(),
                merge_ratio,
            )?)
        }
    };
    Ok(retriever)
}

/// Shared by tests across the retrieval modules.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::chunk::{Chunker, ChunkingStrategy};
    use crate::document::Document;
    use crate::index::{DocumentStore, IndexStore, VectorIndex};
    use ragweave_core::{Embedder, LocalHashEmbedder};
    use std::sync::Arc;

    pub fn capitals() -> Vec<Document> {
        vec![
            Document::new("paris.txt", "Paris is the capital of France."),
            Document::new("tokyo.txt", "Tokyo is the capital of Japan."),
            Document::new("rome.txt", "Rome has ancient ruins and good pasta."),
        ]
    }

    /// An in-memory index over `documents`, one node per document.
    pub async fn store_for(documents: &[Document], embedder: &LocalHashEmbedder) -> IndexStore {
        let chunker = Chunker::new(ChunkingStrategy::default(), None).unwrap();
        let nodes = chunker.split(documents).await.unwrap();
        let mut index = VectorIndex::new(embedder.dimensions());
        for node in nodes.iter().filter(|n| n.is_leaf()) {
            index.add(node.id.clone(), embedder.embed_text(&node.text)).unwrap();
        }
        IndexStore {
            index: Arc::new(index),
            docstore: Arc::new(DocumentStore::from_nodes(nodes)),
            manifest: crate::index::IndexManifest {
                version: 1,
                fingerprint: String::new(),
                embedder: embedder.model_id(),
                dimension: embedder.dimensions(),
                node_count: documents.len(),
                built_at: chrono::Utc::now(),
            },
            loaded: false,
        }
    }
}
