//! Google Gemini provider.
//!
//! Gemini differs from the OpenAI protocol in a few ways:
//! - The API key travels as a `key` query parameter
//! - System instruction is a top-level `system_instruction` field
//! - The assistant role is called `model`
//! - Text arrives as a list of parts under `candidates[0].content`

use super::{build_http_client, map_status_error, map_transport_error};
use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use crate::types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
    timeout_secs: u64,
}

impl GeminiProvider {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, ConfigError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| GEMINI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            base_url,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }

    fn endpoint_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        )
    }

    /// Build the JSON request body for the Gemini API.
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let (system_text, non_system) = Self::extract_system_instruction(&request.messages);

        let contents: Vec<Value> = non_system
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": msg.content }] })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens.unwrap_or(self.max_tokens),
                "temperature": request.temperature.unwrap_or(self.temperature),
            },
        });

        if let Some(system) = &system_text {
            body["system_instruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !request.stop_sequences.is_empty() {
            body["generationConfig"]["stopSequences"] = json!(request.stop_sequences);
        }
        body
    }

    /// Split system messages from the rest, joining system texts with blank lines.
    fn extract_system_instruction(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let (system, rest): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let system_text = if system.is_empty() {
            None
        } else {
            Some(
                system
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            )
        };
        (system_text, rest)
    }

    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, LlmError> {
        let candidate = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No candidates in response".to_string(),
            })?;

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No content parts in candidate".to_string(),
            })?;

        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();

        let usage = body
            .get("usageMetadata")
            .map(|u| TokenUsage {
                input_tokens: u
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
                output_tokens: u
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
            })
            .unwrap_or_default();
        debug!(
            model = model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_tokens = usage.total(),
            "Completion token usage"
        );

        Ok(CompletionResponse {
            message: Message::assistant(text),
            usage,
            model: model.to_string(),
            finish_reason: candidate
                .get("finishReason")
                .and_then(|f| f.as_str())
                .map(|s| s.to_lowercase()),
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model).to_string();
        let body = self.build_request_body(&request);

        debug!(model = %model, "Sending Gemini generateContent request");

        let response = self
            .client
            .post(self.endpoint_url(&model))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(match map_status_error("gemini", status.as_u16(), &response_body) {
                // Gemini quota errors carry no usable hint
                LlmError::RateLimited { .. } => LlmError::RateLimited {
                    retry_after_secs: 30,
                },
                other => other,
            });
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;
        Self::parse_response(&json, &model)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
