//! Auto-merging retrieval over a hierarchical split.

use super::vector::VectorRetriever;
use super::{QueryBundle, Retriever};
use crate::index::DocumentStore;
use crate::node::Candidate;
use async_trait::async_trait;
use ragweave_core::{ConfigError, RagError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Vector retrieval over leaves that collapses sibling hits into their parent.
///
/// When more than `merge_ratio` of a parent's children were retrieved, those
/// children are replaced by the parent, scored with the mean of their scores.
/// Merging repeats until nothing changes, so it can climb several levels.
pub struct AutoMergeRetriever {
    base: VectorRetriever,
    docstore: Arc<DocumentStore>,
    merge_ratio: f32,
}

impl AutoMergeRetriever {
    pub fn new(
        base: VectorRetriever,
        docstore: Arc<DocumentStore>,
        merge_ratio: f32,
    ) -> Result<Self, ConfigError> {
        if !docstore.nodes().iter().any(|n| n.hierarchy.is_some()) {
            return Err(ConfigError::missing_dependency(
                "auto-merge retrieval",
                "hierarchical chunking",
            ));
        }
        if !(0.0..=1.0).contains(&merge_ratio) {
            return Err(ConfigError::invalid(format!(
                "retrieval.merge_ratio must be within 0-1, got {}",
                merge_ratio
            )));
        }
        Ok(Self {
            base,
            docstore,
            merge_ratio,
        })
    }

    /// Apply merge passes until a fixed point, then order by score.
    pub fn merge(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        loop {
            // Parent ids in first-seen order, with the positions of their retrieved children.
            let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
            for (i, c) in candidates.iter().enumerate() {
                if let Some(parent) = c.node.parent_id() {
                    match groups.iter_mut().find(|(p, _)| p == parent) {
                        Some((_, members)) => members.push(i),
                        None => groups.push((parent.to_string(), vec![i])),
                    }
                }
            }

            let mut replaced: HashSet<usize> = HashSet::new();
            let mut merged_at: Vec<(usize, Candidate)> = Vec::new();
            for (parent_id, members) in groups {
                let Some(parent) = self.docstore.get(&parent_id) else {
                    continue;
                };
                let total = parent
                    .hierarchy
                    .as_ref()
                    .map(|h| h.child_ids.len())
                    .unwrap_or(0);
                if total == 0 || (members.len() as f32 / total as f32) <= self.merge_ratio {
                    continue;
                }
                let score =
                    members.iter().map(|&i| candidates[i].score).sum::<f32>() / members.len() as f32;
                debug!(
                    parent = %parent_id,
                    children = members.len(),
                    total = total,
                    "Merging retrieved children into parent"
                );
                merged_at.push((
                    members[0],
                    Candidate {
                        node: parent,
                        score,
                        source: "automerge".to_string(),
                    },
                ));
                replaced.extend(members);
            }

            if merged_at.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(candidates.len());
            for (i, c) in candidates.into_iter().enumerate() {
                if let Some(pos) = merged_at.iter().position(|(at, _)| *at == i) {
                    next.push(merged_at.swap_remove(pos).1);
                } else if !replaced.contains(&i) {
                    next.push(c);
                }
            }
            candidates = next;
        }

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }
}

#[async_trait]
impl Retriever for AutoMergeRetriever {
    fn name(&self) -> &str {
        "automerge"
    }

    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Candidate>, RagError> {
        let leaves = self.base.retrieve(query).await?;
        let merged = self
            .merge(leaves)
            .into_iter()
            .map(|mut c| {
                c.source = self.name().to_string();
                c
            })
            .collect();
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunker, ChunkingStrategy};
    use crate::document::Document;
    use crate::index::VectorIndex;
    use ragweave_core::{Embedder, LocalHashEmbedder};

    const TEXT: &str = "Aaaa bbbb. Cccc dddd. Eeee ffff. Gggg hhhh.";

    async fn hierarchical_store() -> (Arc<VectorIndex>, Arc<DocumentStore>) {
        let chunker = Chunker::new(
            ChunkingStrategy::Hierarchical {
                chunk_sizes: vec![64, 22, 10],
                chunk_overlap: 0,
            },
            None,
        )
        .unwrap();
        let nodes = chunker.split(&[Document::new("doc", TEXT)]).await.unwrap();
        let embedder = LocalHashEmbedder::new(256);
        let mut index = VectorIndex::new(256);
        for node in nodes.iter().filter(|n| n.is_leaf()) {
            index.add(node.id.clone(), embedder.embed_text(&node.text)).unwrap();
        }
        (Arc::new(index), Arc::new(DocumentStore::from_nodes(nodes)))
    }

    async fn retriever(top_k: usize, ratio: f32) -> AutoMergeRetriever {
        let (index, docstore) = hierarchical_store().await;
        let embedder: Arc<dyn Embedder> = Arc::new(LocalHashEmbedder::new(256));
        let base = VectorRetriever::new(index, docstore.clone(), embedder, top_k);
        AutoMergeRetriever::new(base, docstore, ratio).unwrap()
    }

    fn candidate(store: &DocumentStore, id: &str, score: f32) -> Candidate {
        Candidate {
            node: store.get(id).unwrap(),
            score,
            source: "vector".into(),
        }
    }

    #[tokio::test]
    async fn test_siblings_merge_into_parent() {
        let r = retriever(2, 0.5).await;
        let results = r
            .retrieve(&QueryBundle::new("aaaa bbbb cccc dddd"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.id, "doc-L1-0");
        assert_eq!(results[0].node.text, "Aaaa bbbb. Cccc dddd.");
        assert_eq!(results[0].source, "automerge");
    }

    #[tokio::test]
    async fn test_half_of_children_does_not_merge() {
        let r = retriever(4, 0.5).await;
        let store = r.docstore.clone();
        let merged = r.merge(vec![
            candidate(&store, "doc-L2-0", 0.9),
            candidate(&store, "doc-L2-2", 0.4),
        ]);
        let ids: Vec<&str> = merged.iter().map(|c| c.node.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-L2-0", "doc-L2-2"]);
    }

    #[tokio::test]
    async fn test_merge_climbs_levels_with_mean_score() {
        let r = retriever(4, 0.5).await;
        let store = r.docstore.clone();
        let merged = r.merge(vec![
            candidate(&store, "doc-L2-0", 0.8),
            candidate(&store, "doc-L2-1", 0.6),
            candidate(&store, "doc-L2-2", 0.4),
            candidate(&store, "doc-L2-3", 0.2),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].node.id, "doc-L0-0");
        assert!((merged[0].score - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_requires_hierarchy() {
        let embedder = LocalHashEmbedder::new(64);
        let store = crate::retriever::test_support::store_for(
            &crate::retriever::test_support::capitals(),
            &embedder,
        )
        .await;
        let base = VectorRetriever::new(
            store.index.clone(),
            store.docstore.clone(),
            Arc::new(embedder),
            2,
        );
        let result = AutoMergeRetriever::new(base, store.docstore, 0.5);
        assert!(matches!(result, Err(ConfigError::MissingDependency { .. })));
    }
}
