//! Scripted decision model for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::client::DecisionModel;
use super::errors::InferenceError;
use super::types::{ChatMessage, ModelTurn, ToolCall, ToolDefinition};

/// Plays back a fixed list of turns, then repeats `fallback` if set.
pub(crate) struct ScriptedModel {
    turns: Mutex<VecDeque<Result<ModelTurn, InferenceError>>>,
    fallback: Option<ModelTurn>,
    delay: Option<Duration>,
    seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
    seen_tools: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub(crate) fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().map(Ok).collect()),
            fallback: None,
            delay: None,
            seen_messages: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
        }
    }

    /// Answer every turn with the same decision.
    pub(crate) fn repeating(turn: ModelTurn) -> Self {
        Self {
            fallback: Some(turn),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn failing(error: InferenceError) -> Self {
        let model = Self::new(Vec::new());
        model.turns.lock().unwrap().push_back(Err(error));
        model
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Messages the model saw on each turn.
    pub(crate) fn seen_messages(&self) -> Vec<Vec<ChatMessage>> {
        self.seen_messages.lock().unwrap().clone()
    }

    /// Tool names offered on each turn.
    pub(crate) fn seen_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().unwrap().clone()
    }

    pub(crate) fn turns_taken(&self) -> usize {
        self.seen_messages.lock().unwrap().len()
    }
}

#[async_trait]
impl DecisionModel for ScriptedModel {
    async fn next_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        self.seen_messages.lock().unwrap().push(messages.to_vec());
        self.seen_tools
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.function.name.clone()).collect());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.turns.lock().unwrap().pop_front();
        match next {
            Some(turn) => turn,
            None => Ok(self.fallback.clone().unwrap_or(ModelTurn::Final {
                text: "script exhausted".into(),
            })),
        }
    }
}

pub(crate) fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

pub(crate) fn tool_turn(calls: Vec<ToolCall>) -> ModelTurn {
    ModelTurn::ToolCalls { text: None, calls }
}

pub(crate) fn narrated_tool_turn(text: &str, calls: Vec<ToolCall>) -> ModelTurn {
    ModelTurn::ToolCalls {
        text: Some(text.to_string()),
        calls,
    }
}

pub(crate) fn final_turn(text: &str) -> ModelTurn {
    ModelTurn::Final { text: text.to_string() }
}
