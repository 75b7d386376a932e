//! # Ragweave Core
//!
//! Provider layer for the Ragweave RAG pipeline builder.
//! Provides the LLM interface (brain), provider adapters with retry,
//! embedding providers, credential resolution, and the error taxonomy.

pub mod brain;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod providers;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{LlmProvider, MockLlmProvider};
pub use config::{
    CredentialRequirement, EmbeddingConfig, EmbeddingProviderKind, LlmConfig, ProviderKind,
    ResolvedCredentials, RetryConfig, env_lookup,
};
pub use embeddings::{Embedder, LocalHashEmbedder, create_embedder};
pub use error::{ConfigError, LlmError, PipelineStage, RagError, Result};
pub use providers::create_provider;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};
