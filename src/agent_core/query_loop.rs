//! QueryLoop — drives one user query through the model ↔ tools cycle.
//!
//! States per query:
//!
//! ```text
//! AwaitingModel ──final answer──────────────────────────▶ Done
//!      ▲   │
//!      │   └─tool calls─▶ Dispatching (fan-out / fan-in) ─┐
//!      └──────────────────────────────────────────────────┘
//! ```
//!
//! Every round takes a fresh capability snapshot, so servers pruned or
//! added between rounds are reflected in the tools the model is offered.
//! A query that fails leaves the conversation exactly as it was before.

use std::sync::Arc;
use std::time::Duration;

use crate::inference::types::{ModelTurn, ToolDefinition};
use crate::inference::DecisionModel;
use crate::mcp_client::capabilities::CapabilityTable;
use crate::mcp_client::McpClient;

use super::conversation::Conversation;
use super::errors::AgentError;
use super::tool_router::ToolRouter;
use super::types::{AgentConfig, PendingInvocation, QueryOutcome, ToolRound};

/// Runs queries against one decision model.
pub struct QueryLoop {
    model: Arc<dyn DecisionModel>,
    router: ToolRouter,
    config: AgentConfig,
}

impl QueryLoop {
    pub fn new(model: Arc<dyn DecisionModel>, config: AgentConfig) -> Self {
        Self {
            router: ToolRouter::new(config.max_tool_result_chars),
            model,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Answer `query`, appending the exchange to `conversation`.
    pub async fn run(
        &self,
        client: &McpClient,
        conversation: &mut Conversation,
        query: &str,
    ) -> Result<QueryOutcome, AgentError> {
        let mark = conversation.mark();
        conversation.push_user(query);

        let result = match self.config.query_timeout_secs {
            Some(secs) => {
                tokio::time::timeout(Duration::from_secs(secs), self.drive(client, conversation))
                    .await
                    .unwrap_or(Err(AgentError::QueryTimeout { secs }))
            }
            None => self.drive(client, conversation).await,
        };

        match &result {
            Ok(outcome) => tracing::info!(
                iterations = outcome.iterations,
                invocations = outcome.invocations.len(),
                "query finished"
            ),
            Err(e) => {
                tracing::warn!(error = %e, "query failed, rolling back conversation");
                conversation.truncate(mark);
            }
        }
        result
    }

    async fn drive(
        &self,
        client: &McpClient,
        conversation: &mut Conversation,
    ) -> Result<QueryOutcome, AgentError> {
        let mut invocations = Vec::new();
        let mut rounds = Vec::new();

        for iteration in 1..=self.config.max_iterations {
            let table = client.capabilities();
            let tools = tool_definitions(&table);

            let turn = self.model.next_turn(&conversation.messages(), &tools).await?;
            match turn {
                ModelTurn::Final { text } => {
                    conversation.push_assistant(&text);
                    return Ok(QueryOutcome {
                        answer: text,
                        iterations: iteration,
                        invocations,
                        rounds,
                    });
                }
                ModelTurn::ToolCalls { text, calls } => {
                    tracing::debug!(iteration, calls = calls.len(), "dispatching tool calls");
                    conversation.push_tool_calls(text.as_deref(), &calls);

                    let pending: Vec<PendingInvocation> =
                        calls.iter().map(PendingInvocation::from).collect();
                    let outcomes = self.router.dispatch_phase(&table, &pending).await;
                    for outcome in &outcomes {
                        conversation.push_tool_result(&outcome.correlation_id, &outcome.text);
                    }
                    rounds.push(ToolRound {
                        text: text.filter(|t| !t.trim().is_empty()),
                        calls: outcomes.len(),
                    });
                    invocations.extend(outcomes);
                }
            }
        }

        Err(AgentError::IterationLimit {
            limit: self.config.max_iterations,
        })
    }
}

/// Tools in the table as OpenAI function definitions, in registration order.
pub fn tool_definitions(table: &CapabilityTable) -> Vec<ToolDefinition> {
    table
        .tools()
        .map(|entry| {
            let parameters = if entry.schema.is_object() {
                entry.schema.clone()
            } else {
                serde_json::json!({"type": "object", "properties": {}})
            };
            let description = entry.description.as_deref().unwrap_or("");
            ToolDefinition::function(&entry.name, description, parameters)
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
