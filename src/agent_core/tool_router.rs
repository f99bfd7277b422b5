//! ToolRouter — dispatches one phase of model tool calls to MCP servers.
//!
//! The ToolRouter is the bridge between the model's tool call decisions and
//! the connected servers. For each dispatch phase it:
//! - Validates and resolves every invocation against a table snapshot
//! - Groups resolved invocations by owning session
//! - Runs the groups concurrently, each group's calls in request order
//! - Joins all groups, then returns outcomes in the model's request order
//!
//! Failures never escape as errors: an unknown tool, a dead session, or a
//! timeout becomes an `InvocationOutcome` the model can read and react to.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use crate::mcp_client::capabilities::CapabilityTable;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::session::Session;
use crate::mcp_client::types::{CallToolResult, CapabilityKind, Content};

use super::types::{
    InvocationOutcome, InvocationStatus, PendingInvocation, DEFAULT_MAX_TOOL_RESULT_CHARS,
};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Fed back to the model when a tool returns nothing at all.
pub const EMPTY_RESULT_MESSAGE: &str = "The operation completed but didn't return any results.";

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Resolves and executes tool invocations.
#[derive(Debug, Clone)]
pub struct ToolRouter {
    max_result_chars: usize,
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOOL_RESULT_CHARS)
    }
}

/// Invocations bound for one session, as indices into the phase.
struct Group {
    server: String,
    session: Arc<Session>,
    indices: Vec<usize>,
}

impl ToolRouter {
    pub fn new(max_result_chars: usize) -> Self {
        Self { max_result_chars }
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Run one dispatch phase. Returns one outcome per invocation, in order.
    pub async fn dispatch_phase(
        &self,
        table: &CapabilityTable,
        invocations: &[PendingInvocation],
    ) -> Vec<InvocationOutcome> {
        let mut outcomes: Vec<Option<InvocationOutcome>> = vec![None; invocations.len()];
        let mut groups: Vec<Group> = Vec::new();

        for (i, invocation) in invocations.iter().enumerate() {
            match self.route(table, invocation) {
                Ok((server, session)) => match groups.iter_mut().find(|g| g.server == server) {
                    Some(group) => group.indices.push(i),
                    None => groups.push(Group {
                        server,
                        session,
                        indices: vec![i],
                    }),
                },
                Err(outcome) => outcomes[i] = Some(outcome),
            }
        }

        tracing::debug!(
            invocations = invocations.len(),
            groups = groups.len(),
            "dispatch phase started"
        );

        let runs = groups.iter().map(|group| async move {
            let mut done = Vec::with_capacity(group.indices.len());
            for &i in &group.indices {
                let outcome = self.invoke(&group.session, &group.server, &invocations[i]).await;
                done.push((i, outcome));
            }
            done
        });

        for (i, outcome) in join_all(runs).await.into_iter().flatten() {
            outcomes[i] = Some(outcome);
        }

        outcomes.into_iter().flatten().collect()
    }

    /// Validate an invocation and find the session that serves it.
    fn route(
        &self,
        table: &CapabilityTable,
        invocation: &PendingInvocation,
    ) -> Result<(String, Arc<Session>), InvocationOutcome> {
        let server = table
            .get(CapabilityKind::Tool, &invocation.capability)
            .map(|entry| entry.server.clone());

        table
            .validate_tool_call(&invocation.capability, &invocation.arguments)
            .and_then(|()| table.resolve(CapabilityKind::Tool, &invocation.capability))
            .map(|session| (session.server_name().to_string(), session))
            .map_err(|e| failure_outcome(invocation, server, &e, 0))
    }

    /// Execute one call on its session.
    async fn invoke(
        &self,
        session: &Session,
        server: &str,
        invocation: &PendingInvocation,
    ) -> InvocationOutcome {
        let start = Instant::now();
        let arguments = match &invocation.arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };

        let result = session.call_tool(&invocation.capability, arguments).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(result) => {
                let text = truncate_tool_result(
                    &render_tool_result(&result),
                    self.max_result_chars,
                    &invocation.capability,
                );
                let (status, text) = if result.is_error {
                    (InvocationStatus::ToolError, format!("Tool reported an error: {text}"))
                } else {
                    (InvocationStatus::Success, text)
                };
                InvocationOutcome {
                    correlation_id: invocation.correlation_id.clone(),
                    capability: invocation.capability.clone(),
                    arguments: invocation.arguments.clone(),
                    server: Some(server.to_string()),
                    status,
                    text,
                    elapsed_ms,
                }
            }
            Err(e) => failure_outcome(invocation, Some(server.to_string()), &e, elapsed_ms),
        };

        tracing::info!(
            tool = %invocation.capability,
            server = %server,
            status = ?outcome.status,
            elapsed_ms,
            "tool call finished"
        );
        outcome
    }
}

fn failure_outcome(
    invocation: &PendingInvocation,
    server: Option<String>,
    error: &McpError,
    elapsed_ms: u64,
) -> InvocationOutcome {
    let status = match error {
        McpError::UnknownCapability { .. } => InvocationStatus::UnknownCapability,
        McpError::InvalidArguments { .. } | McpError::ServerError { .. } => {
            InvocationStatus::ToolError
        }
        _ => InvocationStatus::InfraError,
    };

    tracing::warn!(
        tool = %invocation.capability,
        server = server.as_deref().unwrap_or("-"),
        status = ?status,
        error = %error,
        "tool call failed"
    );

    InvocationOutcome {
        correlation_id: invocation.correlation_id.clone(),
        capability: invocation.capability.clone(),
        arguments: invocation.arguments.clone(),
        server,
        status,
        text: format!("Error: {error}"),
        elapsed_ms,
    }
}

// ─── Result Rendering ───────────────────────────────────────────────────────

/// Render a `tools/call` result as text for the model.
///
/// Text items are joined with newlines; anything else is pretty JSON.
pub fn render_tool_result(result: &CallToolResult) -> String {
    let parts: Vec<String> = result
        .content
        .iter()
        .map(|item| match item {
            Content::Text { text } => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| format!("{other:?}")),
        })
        .filter(|part| !part.is_empty())
        .collect();

    if !parts.is_empty() {
        return parts.join("\n");
    }

    match &result.structured_content {
        Some(value) if !value.is_null() => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        _ => EMPTY_RESULT_MESSAGE.to_string(),
    }
}

/// Cap a tool result at `max_chars` bytes, on a char boundary, with a notice.
pub fn truncate_tool_result(result: &str, max_chars: usize, tool_name: &str) -> String {
    if result.len() <= max_chars {
        return result.to_string();
    }

    let truncated = truncate_utf8(result, max_chars);
    tracing::warn!(
        tool = %tool_name,
        original_len = result.len(),
        truncated_to = truncated.len(),
        "tool result truncated"
    );
    format!(
        "{truncated}\n\n[... truncated: showing first {} of {} chars]",
        truncated.len(),
        result.len()
    )
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ──────────────────────────────────────────────────────────────────
