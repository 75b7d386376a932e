//! # ragweave-rag: Retrieval-Augmented Generation pipeline
//!
//! Documents are split into nodes, embedded into a persisted index, and
//! served through one or more retrieval strategies whose results are fused,
//! optionally reranked, and synthesized into an answer by a query engine.
//!
//! ## Stages
//!
//! 1. **Chunking**: sentence, window, semantic or hierarchical splits
//! 2. **Indexing**: exact L2 vector index plus document store, fingerprinted
//! 3. **Retrieval**: vector, BM25 and auto-merge strategies
//! 4. **Fusion**: weighted score fusion across strategies and query variants
//! 5. **Rerank**: cross-encoder, LLM, metadata replacement or Cohere
//! 6. **Query engine**: direct, hypothetical-document and multi-step modes

// Inputs
pub mod config;
pub mod document;

// Indexing
pub mod chunk;
pub mod index;
pub mod node;

// Retrieval
pub mod fusion;
pub mod rerank;
pub mod retriever;

// Generation
pub mod prompts;
pub mod query_engine;

// Assembly & evaluation
pub mod evaluation;
pub mod pipeline;

// Re-exports
pub use chunk::{Chunker, ChunkingStrategy};
pub use config::{RagConfig, load_config};
pub use document::{Document, load_documents};
pub use evaluation::{Testset, TestsetConfig, TestsetGenerator, evaluate_retrieval};
pub use fusion::{FusionMode, FusionRetriever};
pub use index::{IndexSettings, IndexStore, StalePolicy};
pub use node::{Candidate, Node, ScoredNode};
pub use pipeline::{PipelineComponents, RagPipeline, RetrievalPipeline};
pub use query_engine::{QueryEngine, QueryMode, Response};
pub use rerank::{RerankConfig, RerankStrategy, Reranker, build_reranker};
pub use retriever::{QueryBundle, RetrievalMethod, Retriever, build_retriever};
