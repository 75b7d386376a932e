//! Provider configuration and one-shot credential resolution.
//!
//! Every API key the pipeline needs is looked up exactly once, at startup,
//! into a [`ResolvedCredentials`] value. Adapters receive that value and never
//! read the process environment themselves.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const HUGGINGFACE_ROUTER_URL: &str = "https://router.huggingface.co/v1";
const OLLAMA_OPENAI_URL: &str = "http://localhost:11434/v1";

/// Which LLM backend answers completion requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    #[serde(alias = "open-source", alias = "hf")]
    HuggingFace,
    /// A locally served model (Ollama or any OpenAI-compatible server).
    #[default]
    #[serde(alias = "ollama")]
    Local,
}

impl ProviderKind {
    /// Environment variable holding the API key, if the provider needs one.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Gemini => Some("GOOGLE_API_KEY"),
            ProviderKind::HuggingFace => Some("HUGGING_FACE_TOKEN"),
            ProviderKind::Local => None,
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some(OPENAI_BASE_URL),
            ProviderKind::HuggingFace => Some(HUGGINGFACE_ROUTER_URL),
            ProviderKind::Local => Some(OLLAMA_OPENAI_URL),
            ProviderKind::Gemini => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::HuggingFace => write!(f, "huggingface"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" => Ok(ProviderKind::Gemini),
            "huggingface" | "open-source" | "hf" => Ok(ProviderKind::HuggingFace),
            "local" | "ollama" => Ok(ProviderKind::Local),
            _ => Err(ConfigError::unknown_strategy("llm provider", s)),
        }
    }
}

/// True when a URL points at the local machine.
pub fn is_local_url(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("[::1]")
}

/// A credential the pipeline cannot run without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequirement {
    pub provider: String,
    pub var: String,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    /// Model identifier (e.g., "gpt-4o-mini", "gemini-1.5-flash", "llama3.1:8b").
    pub model: String,
    /// Overrides the provider's default API-key environment variable.
    pub api_key_env: Option<String>,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Default temperature for generation.
    pub temperature: f32,
    /// Per-request timeout. Local model servers can be slow to answer.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            model: "llama3.1:8b".to_string(),
            api_key_env: None,
            base_url: None,
            max_tokens: 1024,
            temperature: 0.1,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    /// The endpoint this config talks to, after applying defaults.
    pub fn effective_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.provider.default_base_url().map(str::to_string))
    }

    /// The API key this provider needs, or `None` for keyless local serving.
    pub fn credential_requirement(&self) -> Option<CredentialRequirement> {
        if let Some(url) = &self.base_url
            && is_local_url(url)
        {
            return None;
        }
        let var = self
            .api_key_env
            .clone()
            .or_else(|| self.provider.default_api_key_env().map(str::to_string))?;
        Some(CredentialRequirement {
            provider: self.provider.to_string(),
            var,
        })
    }

    /// Validate this LLM config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.model.trim().is_empty() {
            warnings.push("llm.model is empty; the provider will reject requests".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            warnings.push(format!(
                "llm.temperature ({}) is outside the usual 0.0-2.0 range",
                self.temperature
            ));
        }
        if self.timeout_secs == 0 {
            warnings.push("llm.timeout_secs is 0; every request will time out".to_string());
        }
        warnings
    }
}

/// Which backend turns text into vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingProviderKind {
    /// Deterministic hashed bag-of-words, computed in process.
    #[default]
    #[serde(rename = "local-hash", alias = "local")]
    LocalHash,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "huggingface", alias = "open-source")]
    HuggingFace,
}

impl std::fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProviderKind::LocalHash => write!(f, "local-hash"),
            EmbeddingProviderKind::OpenAi => write!(f, "openai"),
            EmbeddingProviderKind::Ollama => write!(f, "ollama"),
            EmbeddingProviderKind::HuggingFace => write!(f, "huggingface"),
        }
    }
}

impl FromStr for EmbeddingProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local-hash" | "local" => Ok(EmbeddingProviderKind::LocalHash),
            "openai" => Ok(EmbeddingProviderKind::OpenAi),
            "ollama" => Ok(EmbeddingProviderKind::Ollama),
            "huggingface" | "open-source" => Ok(EmbeddingProviderKind::HuggingFace),
            _ => Err(ConfigError::unknown_strategy("embedding provider", s)),
        }
    }
}

/// Configuration for embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    /// Provider-specific model name.
    pub model: Option<String>,
    /// Embedding dimensions (provider default if 0).
    pub dimensions: usize,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::LocalHash,
            model: None,
            dimensions: 0,
            base_url: None,
            api_key_env: None,
            timeout_secs: 60,
        }
    }
}

impl EmbeddingConfig {
    pub fn credential_requirement(&self) -> Option<CredentialRequirement> {
        let default_var = match self.provider {
            EmbeddingProviderKind::OpenAi => "OPENAI_API_KEY",
            EmbeddingProviderKind::HuggingFace => "HUGGING_FACE_TOKEN",
            EmbeddingProviderKind::LocalHash | EmbeddingProviderKind::Ollama => return None,
        };
        Some(CredentialRequirement {
            provider: format!("{} embeddings", self.provider),
            var: self
                .api_key_env
                .clone()
                .unwrap_or_else(|| default_var.to_string()),
        })
    }
}

/// Retry policy applied at every provider adapter boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all. Useful in tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Reads a variable from the process environment, treating empty as unset.
pub fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// API keys resolved once at startup.
#[derive(Clone, Default)]
pub struct ResolvedCredentials {
    keys: BTreeMap<String, String>,
}

impl std::fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("vars", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key directly.
    pub fn with_key(mut self, var: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(var.into(), value.into());
        self
    }

    /// Resolve every requirement through `lookup`, failing on the first
    /// missing one.
    pub fn resolve<'a, I, F>(requirements: I, lookup: F) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a CredentialRequirement>,
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = Self::new();
        for req in requirements {
            if resolved.keys.contains_key(&req.var) {
                continue;
            }
            let value = lookup(&req.var).ok_or_else(|| ConfigError::MissingCredential {
                var: req.var.clone(),
                provider: req.provider.clone(),
            })?;
            resolved.keys.insert(req.var.clone(), value);
        }
        Ok(resolved)
    }

    pub fn get(&self, var: &str) -> Option<&str> {
        self.keys.get(var).map(String::as_str)
    }

    /// The key for a requirement, or a `MissingCredential` error naming it.
    pub fn key_for(&self, req: &CredentialRequirement) -> Result<String, ConfigError> {
        self.get(&req.var)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingCredential {
                var: req.var.clone(),
                provider: req.provider.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
