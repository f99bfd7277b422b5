//! Inference Client — OpenAI-compatible API client for the decision model.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with native JSON tool calls
//! - The `DecisionModel` seam the query loop drives
//! - Model configuration (the `model` section of the app config)
//!
//! The client speaks the OpenAI Chat Completions API, making the model
//! interchangeable via config.

pub mod client;
pub mod config;
pub mod errors;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{DecisionModel, InferenceClient};
pub use config::ModelConfig;
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelTurn, Role, ToolCall, ToolDefinition};
