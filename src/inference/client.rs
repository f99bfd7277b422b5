//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests and turns each reply into a
//! `ModelTurn`: either a final answer or a batch of tool calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use uuid::Uuid;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::types::{ChatCompletionRequest, ChatMessage, ModelTurn, ToolCall, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── DecisionModel ───────────────────────────────────────────────────────────

/// Anything that can pick the next step of a query.
#[async_trait]
pub trait DecisionModel: Send + Sync {
    async fn next_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for one OpenAI-compatible chat completions endpoint.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
}

impl InferenceClient {
    /// Build a client. Does NOT check connectivity; that happens on the first request.
    pub fn new(config: ModelConfig) -> Result<Self, InferenceError> {
        config.validate()?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, config })
    }

    /// The model identifier sent with each request.
    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    /// Send a non-streaming chat completion request.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        let url = self.config.completions_url();
        let tools = (!tools.is_empty()).then(|| tools.to_vec());

        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages.to_vec(),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        // Log the request metadata, not the body; it can be huge.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "llm request"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = self.config.api_key() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to read response body: {e}"),
        })?;

        let turn = parse_completion(&body_text)?;
        match &turn {
            ModelTurn::Final { text } => tracing::info!(chars = text.len(), "llm final answer"),
            ModelTurn::ToolCalls { calls, .. } => {
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                tracing::info!(tools = ?names, "llm requested tool calls");
            }
        }
        Ok(turn)
    }
}

#[async_trait]
impl DecisionModel for InferenceClient {
    async fn next_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        self.chat_completion(messages, tools).await
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Parse a non-streaming chat completion body.
pub fn parse_completion(body: &str) -> Result<ModelTurn, InferenceError> {
    #[derive(Deserialize)]
    struct CompletionResponse {
        choices: Vec<CompletionChoice>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: CompletionMessage,
    }

    #[derive(Deserialize)]
    struct CompletionMessage {
        content: Option<String>,
        tool_calls: Option<Vec<CompletionToolCall>>,
    }

    #[derive(Deserialize)]
    struct CompletionToolCall {
        id: Option<String>,
        function: CompletionFunction,
    }

    #[derive(Deserialize)]
    struct CompletionFunction {
        name: String,
        #[serde(default)]
        arguments: String,
    }

    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse completion: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        let raw = tc.function.arguments;
        let arguments = if raw.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&raw).map_err(|e| InferenceError::ToolCallParseError {
                raw_arguments: raw.clone(),
                reason: format!("invalid JSON: {e}"),
            })?
        };
        calls.push(ToolCall {
            id,
            name: tc.function.name,
            arguments,
        });
    }

    if calls.is_empty() {
        Ok(ModelTurn::Final {
            text: content.unwrap_or_default(),
        })
    } else {
        Ok(ModelTurn::ToolCalls { text: content, calls })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
