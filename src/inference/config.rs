//! Model endpoint configuration.
//!
//! The `model` section of the app config. Any OpenAI-compatible endpoint
//! works; switching models is a config change, not a code change.

use serde::Deserialize;

use super::errors::InferenceError;

/// Default completion budget per turn.
const DEFAULT_MAX_TOKENS: u32 = 2024;

/// A single model endpoint's runtime configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible API, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Model identifier sent in each request.
    pub model: String,
    /// Bearer token. Usually supplied through `${LLM_API_KEY}`.
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Whole-request timeout for one completion.
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            model: "llama3.2".into(),
            api_key: None,
            temperature: 0.7,
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout_secs: 120,
        }
    }
}

impl ModelConfig {
    /// Reject values the endpoint would refuse anyway.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.base_url must not be empty".into(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.model must not be empty".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(InferenceError::ConfigError {
                reason: format!("model.temperature {} is outside 0.0..=2.0", self.temperature),
            });
        }
        Ok(())
    }

    /// The chat completions URL for this endpoint.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// An API key that is set and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}
