//! Error types for the Ragweave core library.
//!
//! Uses `thiserror` for public API error types. Failures fall into three
//! classes: configuration problems (fatal, never retried), missing inputs,
//! and external service failures (retried at the adapter boundary, then
//! surfaced with the pipeline stage that was running).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level error type for the Ragweave libraries.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not found: {path}")]
    NotFound { path: PathBuf },

    #[error("External service failed during {stage}: {source}")]
    External {
        stage: PipelineStage,
        #[source]
        source: LlmError,
    },

    #[error("Index error: {message}")]
    Index { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    /// Wrap a provider failure with the stage it interrupted.
    pub fn external(stage: PipelineStage, source: LlmError) -> Self {
        Self::External { stage, source }
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
        }
    }

    /// The failing stage, for external service errors.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::External { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// The pipeline stage an external call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Loading,
    Chunking,
    Embedding,
    Indexing,
    Retrieval,
    Fusion,
    Rerank,
    Transform,
    Synthesis,
    Evaluation,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Loading => "loading",
            PipelineStage::Chunking => "chunking",
            PipelineStage::Embedding => "embedding",
            PipelineStage::Indexing => "indexing",
            PipelineStage::Retrieval => "retrieval",
            PipelineStage::Fusion => "fusion",
            PipelineStage::Rerank => "rerank",
            PipelineStage::Transform => "query transform",
            PipelineStage::Synthesis => "synthesis",
            PipelineStage::Evaluation => "evaluation",
        };
        f.write_str(name)
    }
}

/// Errors from LLM, embedding, and rerank provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Provider server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

/// Errors from the configuration system.
///
/// Every variant is fatal: surfaced immediately and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Missing credential for {provider}: environment variable {var} is not set")]
    MissingCredential { var: String, provider: String },

    #[error("Unknown {kind} strategy: '{tag}'")]
    UnknownStrategy { kind: String, tag: String },

    #[error("{component} requires {dependency}, but none was supplied")]
    MissingDependency {
        component: String,
        dependency: String,
    },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn unknown_strategy(kind: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::UnknownStrategy {
            kind: kind.into(),
            tag: tag.into(),
        }
    }

    pub fn missing_dependency(component: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            component: component.into(),
            dependency: dependency.into(),
        }
    }
}

/// A type alias for results using the top-level `RagError`.
pub type Result<T> = std::result::Result<T, RagError>;
