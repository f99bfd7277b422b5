//! Shared types for the agent core.

use serde::{Deserialize, Serialize};

use crate::inference::types::ToolCall;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Default cap on model ↔ tools rounds per query.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Default cap on the characters of one tool result fed back to the model.
pub const DEFAULT_MAX_TOOL_RESULT_CHARS: usize = 6_000;

// ─── Invocations ────────────────────────────────────────────────────────────

/// One capability call the model asked for, not yet dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInvocation {
    /// Ties the outcome back to the model's tool call.
    pub correlation_id: String,
    pub capability: String,
    pub arguments: serde_json::Value,
}

impl From<&ToolCall> for PendingInvocation {
    fn from(call: &ToolCall) -> Self {
        Self {
            correlation_id: call.id.clone(),
            capability: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

/// How a dispatched invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// The server ran the tool and it succeeded.
    Success,
    /// The tool reported a failure (`isError`), the server rejected the
    /// request, or the arguments failed validation.
    ToolError,
    /// No server exposes the capability.
    UnknownCapability,
    /// The call never completed: dead session, timeout, transport failure.
    InfraError,
}

/// Structured result of one invocation, fed back to the model as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationOutcome {
    pub correlation_id: String,
    pub capability: String,
    /// Arguments as the model sent them.
    pub arguments: serde_json::Value,
    /// Server the call was routed to, if resolution got that far.
    pub server: Option<String>,
    pub status: InvocationStatus,
    pub text: String,
    pub elapsed_ms: u64,
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }
}

/// One model turn that asked for tools.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRound {
    /// Text the model emitted alongside its tool calls.
    pub text: Option<String>,
    /// Number of entries this round added to `QueryOutcome::invocations`.
    pub calls: usize,
}

/// Result of a completed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// The model's final answer.
    pub answer: String,
    /// Model turns taken, including the final one.
    pub iterations: usize,
    /// Every invocation dispatched, in dispatch order.
    pub invocations: Vec<InvocationOutcome>,
    /// Tool-calling turns in order; their `calls` partition `invocations`.
    pub rounds: Vec<ToolRound>,
}

impl QueryOutcome {
    /// Each round paired with the invocations it dispatched.
    pub fn rounds_with_invocations(&self) -> Vec<(&ToolRound, &[InvocationOutcome])> {
        let mut start = 0;
        self.rounds
            .iter()
            .map(|round| {
                let end = (start + round.calls).min(self.invocations.len());
                let slice = &self.invocations[start.min(end)..end];
                start = end;
                (round, slice)
            })
            .collect()
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// The `agent` section of the app config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model turns allowed before a query fails with `IterationLimit`.
    pub max_iterations: usize,
    /// Wall-clock bound on one whole query. `None` means unbounded.
    pub query_timeout_secs: Option<u64>,
    pub max_tool_result_chars: usize,
    /// Prepended to every conversation when set.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            query_timeout_secs: None,
            max_tool_result_chars: DEFAULT_MAX_TOOL_RESULT_CHARS,
            system_prompt: None,
        }
    }
}
