//! Dense nearest-neighbour retrieval.

use super::{QueryBundle, Retriever};
use crate::index::{DocumentStore, VectorIndex};
use crate::node::Candidate;
use async_trait::async_trait;
use ragweave_core::{Embedder, PipelineStage, RagError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Searches the vector index with the mean embedding of the query bundle.
///
/// Score is `1 / (1 + L2 distance)`, so higher is better and an exact match
/// scores 1.0.
pub struct VectorRetriever {
    index: Arc<VectorIndex>,
    docstore: Arc<DocumentStore>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
}

impl VectorRetriever {
    pub fn new(
        index: Arc<VectorIndex>,
        docstore: Arc<DocumentStore>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            docstore,
            embedder,
            top_k,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    async fn query_vector(&self, query: &QueryBundle) -> Result<Vec<f32>, RagError> {
        let vectors = self
            .embedder
            .embed_batch(&query.embedding_strs)
            .await
            .map_err(|e| RagError::external(PipelineStage::Retrieval, e))?;
        let mut mean = vec![0.0f32; self.embedder.dimensions()];
        for vector in &vectors {
            for (m, v) in mean.iter_mut().zip(vector) {
                *m += v;
            }
        }
        if !vectors.is_empty() {
            let n = vectors.len() as f32;
            mean.iter_mut().for_each(|m| *m /= n);
        }
        Ok(mean)
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    fn name(&self) -> &str {
        "vector"
    }

    async fn retrieve(&self, query: &QueryBundle) -> Result<Vec<Candidate>, RagError> {
        let vector = self.query_vector(query).await?;
        let hits = self.index.search(&vector, self.top_k)?;

        let mut candidates = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            match self.docstore.get(id) {
                Some(node) => candidates.push(Candidate {
                    node,
                    score: 1.0 / (1.0 + distance),
                    source: self.name().to_string(),
                }),
                None => warn!(node_id = id, "Vector index references a node missing from the docstore"),
            }
        }
        debug!(retriever = "vector", hits = candidates.len(), "Retrieved candidates");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::test_support::{capitals, store_for};
    use ragweave_core::LocalHashEmbedder;
    use ragweave_core::embeddings::cosine_similarity;

    async fn retriever(top_k: usize) -> VectorRetriever {
        let embedder = LocalHashEmbedder::new(512);
        let store = store_for(&capitals(), &embedder).await;
        VectorRetriever::new(store.index, store.docstore, Arc::new(embedder), top_k)
    }

    #[tokio::test]
    async fn test_vector_retrieval_ranks_best_match_first() {
        let candidates = retriever(2)
            .await
            .retrieve(&QueryBundle::new("capital of France"))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].node.document_id, "paris.txt");
        assert!(candidates[0].score > candidates[1].score);
        assert!(candidates[0].score <= 1.0);
        assert_eq!(candidates[0].source, "vector");
    }

    #[tokio::test]
    async fn test_vector_retrieval_is_deterministic() {
        let r = retriever(3).await;
        let q = QueryBundle::new("ancient pasta");
        let a: Vec<String> = r.retrieve(&q).await.unwrap().iter().map(|c| c.node.id.clone()).collect();
        let b: Vec<String> = r.retrieve(&q).await.unwrap().iter().map(|c| c.node.id.clone()).collect();
        assert_eq!(a, b);
        assert_eq!(a[0], "rome.txt-chunk-0");
    }

    #[tokio::test]
    async fn test_query_vector_averages_bundle() {
        let r = retriever(1).await;
        let bundle = QueryBundle::new("France").with_embedding_strs(vec!["France".into(), "Japan".into()]);
        let mean = r.query_vector(&bundle).await.unwrap();
        let embedder = LocalHashEmbedder::new(512);
        let france = embedder.embed_text("France");
        let japan = embedder.embed_text("Japan");
        assert!(cosine_similarity(&mean, &france) > 0.5);
        assert!(cosine_similarity(&mean, &japan) > 0.5);
    }

    #[tokio::test]
    async fn test_embedder_failure_names_retrieval_stage() {
        struct Broken;
        #[async_trait]
        impl Embedder for Broken {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, ragweave_core::LlmError> {
                Err(ragweave_core::LlmError::Timeout { timeout_secs: 1 })
            }
            fn dimensions(&self) -> usize {
                512
            }
            fn provider_name(&self) -> &str {
                "broken"
            }
        }
        let embedder = LocalHashEmbedder::new(512);
        let store = store_for(&capitals(), &embedder).await;
        let r = VectorRetriever::new(store.index, store.docstore, Arc::new(Broken), 2);
        let err = r.retrieve(&QueryBundle::new("x")).await.unwrap_err();
        assert_eq!(err.stage(), Some(PipelineStage::Retrieval));
    }
}
