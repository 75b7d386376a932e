//! Pipeline configuration.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment -> programmatic overrides.

use crate::chunk::ChunkingStrategy;
use crate::fusion::FusionMode;
use crate::index::IndexSettings;
use crate::query_engine::QueryMode;
use crate::rerank::{RerankConfig, RerankStrategy};
use crate::retriever::{DEFAULT_STRATEGY_TOP_K, RetrievalMethod};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use ragweave_core::{
    ConfigError, CredentialRequirement, EmbeddingConfig, LlmConfig, ResolvedCredentials,
    RetryConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where documents are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
    pub dir: PathBuf,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./documents"),
        }
    }
}

/// One retrieval strategy taking part in fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub method: RetrievalMethod,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default = "default_strategy_top_k")]
    pub top_k: usize,
}

fn default_weight() -> f32 {
    1.0
}

fn default_strategy_top_k() -> usize {
    DEFAULT_STRATEGY_TOP_K
}

/// Fusion retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub strategies: Vec<StrategyConfig>,
    /// Nodes kept after fusion.
    pub top_k: usize,
    /// Queries per strategy, the original included.
    pub num_queries: usize,
    pub mode: FusionMode,
    /// Auto-merge threshold on the fraction of a parent's children retrieved.
    pub merge_ratio: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                StrategyConfig {
                    method: RetrievalMethod::Vector,
                    weight: 0.7,
                    top_k: DEFAULT_STRATEGY_TOP_K,
                },
                StrategyConfig {
                    method: RetrievalMethod::Bm25,
                    weight: 0.3,
                    top_k: DEFAULT_STRATEGY_TOP_K,
                },
            ],
            top_k: 5,
            num_queries: 1,
            mode: FusionMode::RelativeScore,
            merge_ratio: 0.5,
        }
    }
}

/// Query engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub mode: QueryMode,
    /// Multi-step: maximum sub-questions.
    pub max_steps: usize,
    /// HyDE: also embed the original query.
    pub include_original: bool,
    /// Multi-step: description of the document collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_summary: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            mode: QueryMode::Direct,
            max_steps: 3,
            include_original: true,
            index_summary: None,
        }
    }
}

/// Top-level configuration for a pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retry: RetryConfig,
    pub documents: DocumentsConfig,
    pub chunking: ChunkingStrategy,
    pub index: IndexSettings,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub query: QueryConfig,
}

impl RagConfig {
    /// Cross-field checks. Anything that would fail later in the pipeline fails here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retrieval = &self.retrieval;
        if retrieval.strategies.is_empty() {
            return Err(ConfigError::invalid(
                "retrieval.strategies must name at least one strategy",
            ));
        }
        for s in &retrieval.strategies {
            if !s.weight.is_finite() || s.weight < 0.0 {
                return Err(ConfigError::invalid(format!(
                    "weight of {} retrieval must be finite and non-negative, got {}",
                    s.method, s.weight
                )));
            }
            if s.top_k == 0 {
                return Err(ConfigError::invalid(format!(
                    "top_k of {} retrieval must be greater than 0",
                    s.method
                )));
            }
            if s.method == RetrievalMethod::AutoMerge && !self.chunking.is_hierarchical() {
                return Err(ConfigError::missing_dependency(
                    "automerge retrieval",
                    "hierarchical chunking",
                ));
            }
        }
        if retrieval.strategies.iter().map(|s| s.weight).sum::<f32>() <= 0.0 {
            return Err(ConfigError::invalid(
                "retrieval strategy weights must not all be zero",
            ));
        }
        if retrieval.top_k == 0 {
            return Err(ConfigError::invalid("retrieval.top_k must be greater than 0"));
        }
        if retrieval.num_queries == 0 {
            return Err(ConfigError::invalid(
                "retrieval.num_queries must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&retrieval.merge_ratio) {
            return Err(ConfigError::invalid(format!(
                "retrieval.merge_ratio must be within 0-1, got {}",
                retrieval.merge_ratio
            )));
        }
        if self.rerank.strategy.is_some() && self.rerank.top_n == 0 {
            return Err(ConfigError::invalid("rerank.top_n must be greater than 0"));
        }
        if self.query.mode == QueryMode::MultiStep && self.query.max_steps == 0 {
            return Err(ConfigError::invalid("query.max_steps must be at least 1"));
        }
        if self.index.embed_batch_size == 0 {
            return Err(ConfigError::invalid(
                "index.embed_batch_size must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Non-fatal issues worth logging.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.llm.validate();
        if self.rerank.strategy == Some(RerankStrategy::Metadata)
            && !matches!(self.chunking, ChunkingStrategy::Window { .. })
        {
            warnings.push(format!(
                "metadata reranking without window chunking leaves text unchanged (chunking is '{}')",
                self.chunking.tag()
            ));
        }
        if self.rerank.strategy.is_some() && self.rerank.top_n > self.retrieval.top_k {
            warnings.push(format!(
                "rerank.top_n ({}) exceeds retrieval.top_k ({}); at most {} nodes reach the reranker",
                self.rerank.top_n, self.retrieval.top_k, self.retrieval.top_k
            ));
        }
        warnings
    }

    /// Every API key the configured providers need.
    pub fn credential_requirements(&self) -> Vec<CredentialRequirement> {
        [
            self.llm.credential_requirement(),
            self.embedding.credential_requirement(),
            self.rerank.credential_requirement(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Resolve all credentials once, failing on the first missing one.
    pub fn resolve_credentials<F>(&self, lookup: F) -> Result<ResolvedCredentials, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        ResolvedCredentials::resolve(&self.credential_requirements(), lookup)
    }
}

/// Load configuration with layered merging:
/// 1. Built-in defaults
/// 2. User config (~/.config/ragweave/config.toml)
/// 3. Workspace config (.ragweave/config.toml)
/// 4. An explicit config file, which must exist
/// 5. Environment variables (RAGWEAVE_SECTION__KEY)
/// 6. Overrides as `(dotted.key, value)` pairs
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: &[(&str, toml::Value)],
) -> Result<RagConfig, ConfigError> {
    // Chunking stays out of the default layer: figment merges tables key by
    // key, and a partial `[chunking]` section must not inherit fields of the
    // default strategy. An absent section falls back to the serde default.
    let toml::Value::Table(mut defaults) =
        toml::Value::try_from(RagConfig::default()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?
    else {
        return Err(ConfigError::ParseError {
            message: "default configuration is not a table".into(),
        });
    };
    defaults.remove("chunking");
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "ragweave", "ragweave") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".ragweave").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("RAGWEAVE_").split("__"));

    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value.clone()));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragweave_core::ProviderKind;

    #[test]
    fn test_defaults_match_reference_setup() {
        let config = RagConfig::default();
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.strategies.len(), 2);
        assert_eq!(config.retrieval.strategies[1].method, RetrievalMethod::Bm25);
        assert_eq!(config.retrieval.strategies[1].top_k, 2);
        assert_eq!(config.rerank.top_n, 3);
        assert_eq!(config.query.mode, QueryMode::Direct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path()), None, &[]).unwrap();
        assert_eq!(config.retrieval.num_queries, 1);
        assert_eq!(config.chunking, ChunkingStrategy::default());
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join(".ragweave");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(
            ws.join("config.toml"),
            r#"
[llm]
provider = "openai"
model = "gpt-4o-mini"

[chunking]
strategy = "window"
window_size = 5

[[retrieval.strategies]]
method = "BM25"
weight = 1.0

[rerank]
strategy = "metadata"

[query]
mode = "hyDE"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, &[]).unwrap();
        assert_eq!(config.llm.provider, ProviderKind::OpenAi);
        assert_eq!(config.chunking, ChunkingStrategy::Window { window_size: 5 });
        assert_eq!(config.retrieval.strategies.len(), 1);
        assert_eq!(config.retrieval.strategies[0].top_k, 2);
        assert_eq!(config.rerank.strategy, Some(RerankStrategy::Metadata));
        assert_eq!(config.query.mode, QueryMode::Hyde);
        assert!(config.warnings().is_empty());
    }

    fn write_workspace_config(dir: &Path, body: &str) {
        let ws = dir.join(".ragweave");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("config.toml"), body).unwrap();
    }

    #[test]
    fn test_partial_sentence_section_is_missing_field() {
        let dir = tempfile::tempdir().unwrap();
        write_workspace_config(
            dir.path(),
            "[chunking]\nstrategy = \"sentence\"\nchunk_size = 256\n",
        );
        let config = load_config(Some(dir.path()), None, &[]).unwrap();
        assert_eq!(
            config.chunking,
            ChunkingStrategy::Sentence {
                chunk_size: Some(256),
                chunk_overlap: None
            }
        );
        let err = crate::chunk::Chunker::new(config.chunking, None).unwrap_err();
        match err {
            ConfigError::MissingField { field } => assert_eq!(field, "chunking.chunk_overlap"),
            other => panic!("Expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_hierarchical_section_does_not_inherit_sentence_overlap() {
        let dir = tempfile::tempdir().unwrap();
        write_workspace_config(
            dir.path(),
            "[chunking]\nstrategy = \"hierarchical\"\nchunk_sizes = [1024, 256, 32]\n",
        );
        let config = load_config(Some(dir.path()), None, &[]).unwrap();
        assert_eq!(
            config.chunking,
            ChunkingStrategy::Hierarchical {
                chunk_sizes: vec![1024, 256, 32],
                chunk_overlap: 0
            }
        );
        assert!(crate::chunk::Chunker::new(config.chunking, None).is_ok());
    }

    #[test]
    fn test_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(
            Some(dir.path()),
            None,
            &[
                ("query.mode", toml::Value::String("multi".into())),
                ("retrieval.top_k", toml::Value::Integer(1)),
            ],
        )
        .unwrap();
        assert_eq!(config.query.mode, QueryMode::MultiStep);
        assert_eq!(config.retrieval.top_k, 1);
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/definitely/not/here.toml")), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_unknown_tag_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[chunking]\nstrategy = \"paragraph\"\n").unwrap();
        let err = load_config(None, Some(&path), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_automerge_requires_hierarchical_chunking() {
        let mut config = RagConfig::default();
        config.retrieval.strategies = vec![StrategyConfig {
            method: RetrievalMethod::AutoMerge,
            weight: 1.0,
            top_k: 6,
        }];
        assert!(matches!(config.validate(), Err(ConfigError::MissingDependency { .. })));
        config.chunking = ChunkingStrategy::from_tag("hierarchical").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = RagConfig::default();
        config.retrieval.strategies[0].weight = -0.1;
        assert!(config.validate().is_err());
        config.retrieval.strategies[0].weight = 0.0;
        config.retrieval.strategies[1].weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metadata_without_window_warns() {
        let mut config = RagConfig::default();
        config.rerank.strategy = Some(RerankStrategy::Metadata);
        assert_eq!(config.warnings().len(), 1);
    }

    #[test]
    fn test_credentials_resolved_once() {
        let mut config = RagConfig::default();
        config.llm.provider = ProviderKind::OpenAi;
        config.embedding.provider = ragweave_core::EmbeddingProviderKind::OpenAi;
        config.rerank.strategy = Some(RerankStrategy::Cohere);

        let reqs = config.credential_requirements();
        assert_eq!(reqs.len(), 3);

        let err = config
            .resolve_credentials(|var| (var == "OPENAI_API_KEY").then(|| "sk".to_string()))
            .unwrap_err();
        match err {
            ConfigError::MissingCredential { var, .. } => assert_eq!(var, "COHERE_API_KEY"),
            other => panic!("Expected MissingCredential, got {:?}", other),
        }

        let creds = config
            .resolve_credentials(|_| Some("key".to_string()))
            .unwrap();
        assert_eq!(creds.len(), 2);
    }

    #[test]
    fn test_config_serializes_to_toml() {
        let text = toml::to_string_pretty(&RagConfig::default()).unwrap();
        assert!(text.contains("[retrieval]"));
        let back: RagConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.retrieval.strategies, RagConfig::default().retrieval.strategies);
    }
}
