//! The LLM provider abstraction used by every generation step.
//!
//! Query generation, HyDE, step decomposition, LLM reranking, synthesis and
//! testset generation all talk to a model through [`LlmProvider`].

use crate::error::LlmError;
use crate::types::{CompletionRequest, CompletionResponse, Message, TokenUsage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;

    /// Single-prompt convenience over [`complete`](Self::complete).
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self.complete(CompletionRequest::from_prompt(prompt)).await?;
        Ok(response.message.content)
    }
}

type Responder = Box<dyn Fn(&str) -> String + Send + Sync>;

/// A scripted provider for tests.
///
/// Answers come from, in order: the queue, the responder closure, then the
/// default reply. Every prompt it receives is recorded.
pub struct MockLlmProvider {
    model: String,
    responses: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    default_reply: String,
    failing: bool,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: Mutex::new(VecDeque::new()),
            responder: None,
            default_reply: "I'm a mock LLM. No queued responses available.".to_string(),
            failing: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always returns the given text.
    pub fn with_response(text: &str) -> Self {
        Self {
            default_reply: text.to_string(),
            ..Self::new()
        }
    }

    /// A mock that computes its reply from the prompt.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// A mock whose every call fails with a connection error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    /// Queue a response to be returned by the next call.
    pub fn queue_response(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(text.into());
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Create a simple text response.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let prompt = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        if self.failing {
            return Err(LlmError::Connection {
                message: "mock provider configured to fail".to_string(),
            });
        }

        let queued = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let text = match (queued, &self.responder) {
            (Some(text), _) => text,
            (None, Some(responder)) => responder(&prompt),
            (None, None) => self.default_reply.clone(),
        };
        Ok(Self::text_response(&text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
