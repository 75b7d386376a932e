//! Pipeline assembly: configuration in, a ready-to-query engine out.
//!
//! Assembly order is fixed. The index is fully built and persisted before
//! any retriever exists, and every collaborator a configured mode needs is
//! checked before the first query.

use crate::chunk::Chunker;
use crate::config::RagConfig;
use crate::document::load_documents;
use crate::fusion::FusionRetriever;
use crate::index::IndexStore;
use crate::node::ScoredNode;
use crate::query_engine::{QueryEngine, Response};
use crate::rerank::{RelevanceModel, build_reranker};
use crate::retriever::{QueryBundle, Retriever, build_retriever};
use ragweave_core::{
    ConfigError, Embedder, LlmProvider, RagError, ResolvedCredentials, create_embedder,
    create_provider,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Provider handles the pipeline is assembled from.
#[derive(Clone)]
pub struct PipelineComponents {
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub embedder: Arc<dyn Embedder>,
    /// Replaces the HTTP cross-encoder client when set.
    pub relevance_model: Option<Arc<dyn RelevanceModel>>,
}

impl PipelineComponents {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            llm: None,
            embedder,
            relevance_model: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_relevance_model(mut self, model: Arc<dyn RelevanceModel>) -> Self {
        self.relevance_model = Some(model);
        self
    }

    /// Construct the configured LLM and embedder.
    pub fn from_config(
        config: &RagConfig,
        credentials: &ResolvedCredentials,
    ) -> Result<Self, ConfigError> {
        let llm = create_provider(&config.llm, credentials, &config.retry)?;
        Ok(Self::embedding_only(config, credentials)?.with_llm(llm))
    }

    /// Only the embedder; enough for indexing and plain retrieval.
    pub fn embedding_only(
        config: &RagConfig,
        credentials: &ResolvedCredentials,
    ) -> Result<Self, ConfigError> {
        let embedder = create_embedder(&config.embedding, credentials, &config.retry)?;
        Ok(Self::new(embedder))
    }
}

impl std::fmt::Debug for PipelineComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineComponents")
            .field("llm", &self.llm.as_ref().map(|l| l.model_name().to_string()))
            .field("embedder", &self.embedder.model_id())
            .field("relevance_model", &self.relevance_model.is_some())
            .finish()
    }
}

/// Summary of the index a pipeline is serving.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub persist_dir: String,
    pub nodes: usize,
    pub leaves: usize,
    pub dimension: usize,
    pub embedder: String,
    pub fingerprint: String,
    pub loaded: bool,
}

impl IndexStatus {
    fn of(store: &IndexStore, config: &RagConfig) -> Self {
        Self {
            persist_dir: config.index.persist_dir.display().to_string(),
            nodes: store.docstore.len(),
            leaves: store.index.len(),
            dimension: store.manifest.dimension,
            embedder: store.manifest.embedder.clone(),
            fingerprint: store.manifest.fingerprint.clone(),
            loaded: store.loaded,
        }
    }
}

/// Chunk, embed and persist the configured document directory.
pub async fn build_index(
    config: &RagConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<IndexStore, RagError> {
    let chunker = Chunker::new(config.chunking.clone(), Some(embedder.clone()))?;
    let documents = load_documents(&config.documents.dir).await?;
    info!(
        dir = %config.documents.dir.display(),
        documents = documents.len(),
        chunking = chunker.strategy().tag(),
        "Indexing documents"
    );
    IndexStore::build_or_load(
        &documents,
        embedder.dimensions(),
        &chunker,
        embedder,
        &config.index,
    )
    .await
}

/// Index plus fusion retriever, without rerank or synthesis.
#[derive(Debug, Clone)]
pub struct RetrievalPipeline {
    store: IndexStore,
    fusion: Arc<FusionRetriever>,
    status: IndexStatus,
}

impl RetrievalPipeline {
    pub async fn build(
        config: &RagConfig,
        components: &PipelineComponents,
    ) -> Result<Self, RagError> {
        config.validate()?;
        for warning in config.warnings() {
            warn!("{}", warning);
        }

        let store = build_index(config, components.embedder.clone()).await?;
        let status = IndexStatus::of(&store, config);

        let retrieval = &config.retrieval;
        let retrievers = retrieval
            .strategies
            .iter()
            .map(|s| {
                build_retriever(
                    s.method,
                    s.top_k,
                    &store,
                    components.embedder.clone(),
                    retrieval.merge_ratio,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = FusionRetriever::builder()
            .retrievers(retrievers)
            .weights(retrieval.strategies.iter().map(|s| s.weight).collect())
            .top_k(retrieval.top_k)
            .mode(retrieval.mode)
            .num_queries(retrieval.num_queries);
        if let Some(llm) = &components.llm {
            builder = builder.llm(llm.clone());
        }
        let fusion = Arc::new(builder.build()?);
        info!(
            strategies = retrieval.strategies.len(),
            top_k = retrieval.top_k,
            mode = %retrieval.mode,
            "Retrieval ready"
        );

        Ok(Self {
            store,
            fusion,
            status,
        })
    }

    /// Fused top-k for `query`.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>, RagError> {
        self.fusion.retrieve_fused(&QueryBundle::new(query)).await
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn status(&self) -> &IndexStatus {
        &self.status
    }

    pub fn fusion(&self) -> Arc<FusionRetriever> {
        self.fusion.clone()
    }
}

/// The assembled pipeline: retrieval, optional rerank, and the query engine.
pub struct RagPipeline {
    retrieval: RetrievalPipeline,
    engine: QueryEngine,
}

impl RagPipeline {
    /// Assemble every stage from `config`. The LLM is required for synthesis.
    pub async fn build(
        config: &RagConfig,
        components: PipelineComponents,
        credentials: &ResolvedCredentials,
    ) -> Result<Self, RagError> {
        // Fail on a missing LLM before the index is built.
        let Some(llm) = components.llm.clone() else {
            return Err(
                ConfigError::missing_dependency("query engine", "an LLM provider").into(),
            );
        };
        let reranker = build_reranker(
            &config.rerank,
            Some(llm.clone()),
            components.relevance_model.clone(),
            credentials,
            &config.retry,
        )?;

        let retrieval = RetrievalPipeline::build(config, &components).await?;

        let fused: Arc<dyn Retriever> = retrieval.fusion();
        let mut builder = QueryEngine::builder()
            .retriever(fused)
            .llm(llm)
            .mode(config.query.mode)
            .max_steps(config.query.max_steps)
            .include_original(config.query.include_original);
        if let Some(summary) = &config.query.index_summary {
            builder = builder.index_summary(summary.clone());
        }
        if let Some(reranker) = reranker {
            info!(reranker = reranker.name(), top_n = config.rerank.top_n, "Reranking enabled");
            builder = builder.reranker(reranker, config.rerank.top_n);
        }
        let engine = builder.build()?;
        info!(mode = %engine.mode(), "Query engine ready");

        Ok(Self { retrieval, engine })
    }

    pub async fn query(&self, query: &str) -> Result<Response, RagError> {
        self.engine.query(query).await
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>, RagError> {
        self.retrieval.retrieve(query).await
    }

    pub fn retrieval(&self) -> &RetrievalPipeline {
        &self.retrieval
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }
}
