//! Chat shell — the line-oriented front end of the chatbot.
//!
//! Each input line is one of:
//! - `quit`: end the session
//! - `/tools`, `/resources`, `/prompts`: list what the servers expose
//! - `/prompt <name> key=value…`: render a server prompt and run it as a query
//! - `@<uri>`: read a resource and print it
//! - anything else: a query for the model
//!
//! Query replies list the tool calls made on the way to the answer.
//!
//! The shell owns the MCP client, the query loop, and the conversation. It
//! never prints; every line yields a reply the binary writes out.

use std::collections::HashMap;

use thiserror::Error;

use crate::agent_core::tool_router::EMPTY_RESULT_MESSAGE;
use crate::agent_core::{Conversation, InvocationStatus, QueryLoop, QueryOutcome};
use crate::mcp_client::registry::ShutdownReport;
use crate::mcp_client::types::{Content, GetPromptResult, ReadResourceResult};
use crate::mcp_client::{CapabilityEntry, McpClient};

// ─── Commands ────────────────────────────────────────────────────────────────

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Blank line.
    Empty,
    Quit,
    ListTools,
    ListResources,
    ListPrompts,
    Prompt {
        name: String,
        arguments: HashMap<String, String>,
    },
    ReadResource {
        uri: String,
    },
    Query(String),
}

/// Input the shell could not make sense of.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("usage: /prompt <name> key=value ...")]
    MissingPromptName,

    #[error("prompt argument '{arg}' is not key=value")]
    BadPromptArgument { arg: String },

    #[error("usage: @<resource uri>")]
    MissingUri,

    #[error("unknown command '/{name}' (try /tools, /resources, /prompts, /prompt)")]
    UnknownCommand { name: String },
}

impl ChatCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("/quit") {
            return Ok(Self::Quit);
        }

        if let Some(uri) = line.strip_prefix('@') {
            let uri = uri.trim();
            if uri.is_empty() {
                return Err(CommandError::MissingUri);
            }
            return Ok(Self::ReadResource { uri: uri.to_string() });
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Query(line.to_string()));
        };

        let mut words = rest.split_whitespace();
        let command = words.next().unwrap_or_default();
        match command {
            "tools" => Ok(Self::ListTools),
            "resources" => Ok(Self::ListResources),
            "prompts" => Ok(Self::ListPrompts),
            "prompt" => {
                let name = words.next().ok_or(CommandError::MissingPromptName)?;
                let mut arguments = HashMap::new();
                for arg in words {
                    let (key, value) = arg
                        .split_once('=')
                        .filter(|(key, _)| !key.is_empty())
                        .ok_or_else(|| CommandError::BadPromptArgument { arg: arg.to_string() })?;
                    arguments.insert(key.to_string(), value.to_string());
                }
                Ok(Self::Prompt {
                    name: name.to_string(),
                    arguments,
                })
            }
            other => Err(CommandError::UnknownCommand { name: other.to_string() }),
        }
    }
}

// ─── ChatShell ───────────────────────────────────────────────────────────────

/// What the binary should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellReply {
    Output(String),
    /// Nothing to print.
    Silent,
    Quit,
}

/// One interactive chat session.
pub struct ChatShell {
    client: McpClient,
    query_loop: QueryLoop,
    conversation: Conversation,
}

impl ChatShell {
    pub fn new(client: McpClient, query_loop: QueryLoop) -> Self {
        let conversation = Conversation::new(query_loop.config().system_prompt.clone());
        Self {
            client,
            query_loop,
            conversation,
        }
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Startup summary: connected servers and what they offer.
    pub fn banner(&self) -> String {
        let table = self.client.capabilities();
        let mut lines = vec![format!(
            "Connected to {} server(s): {}",
            self.client.running_server_count(),
            self.client.running_servers().join(", ")
        )];
        lines.push(table.capability_summary());
        for collision in table.collisions() {
            lines.push(format!(
                "note: {} '{}' from '{}' is shadowed by '{}'",
                collision.kind, collision.name, collision.shadowed, collision.kept
            ));
        }
        lines.push("Type your queries or 'quit' to exit.".to_string());
        lines.join("\n")
    }

    /// Handle one input line.
    pub async fn handle_line(&mut self, line: &str) -> ShellReply {
        let command = match ChatCommand::parse(line) {
            Ok(command) => command,
            Err(e) => return ShellReply::Output(e.to_string()),
        };

        match command {
            ChatCommand::Empty => ShellReply::Silent,
            ChatCommand::Quit => ShellReply::Quit,
            ChatCommand::ListTools => {
                let table = self.client.capabilities();
                ShellReply::Output(render_entries("tools", table.tools()))
            }
            ChatCommand::ListResources => {
                let table = self.client.capabilities();
                ShellReply::Output(render_entries("resources", table.resources()))
            }
            ChatCommand::ListPrompts => {
                let table = self.client.capabilities();
                ShellReply::Output(render_entries("prompts", table.prompts()))
            }
            ChatCommand::ReadResource { uri } => match self.client.read_resource(&uri).await {
                Ok(result) => ShellReply::Output(render_resource(&result)),
                Err(e) => ShellReply::Output(format!("Error: {e}")),
            },
            ChatCommand::Prompt { name, arguments } => {
                match self.client.get_prompt(&name, &arguments).await {
                    Ok(prompt) => {
                        let text = render_prompt(&prompt);
                        tracing::info!(
                            prompt = %name,
                            chars = text.len(),
                            "running prompt as query"
                        );
                        ShellReply::Output(self.run_query(&text).await)
                    }
                    Err(e) => ShellReply::Output(format!("Error: {e}")),
                }
            }
            ChatCommand::Query(query) => ShellReply::Output(self.run_query(&query).await),
        }
    }

    async fn run_query(&mut self, query: &str) -> String {
        let result = self
            .query_loop
            .run(&self.client, &mut self.conversation, query)
            .await;
        let mut output = match result {
            Ok(outcome) => match render_activity(&outcome) {
                Some(activity) => format!("{activity}\n\n{}", outcome.answer),
                None => outcome.answer,
            },
            Err(e) => format!("Error: {e}"),
        };

        let pruned = self.client.prune_unavailable().await;
        if !pruned.is_empty() {
            output.push_str(&format!("\n\n[servers now unavailable: {}]", pruned.join(", ")));
        }
        output
    }

    /// Close every server, last connected first.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.client.shutdown_all().await
    }
}

// ─── Rendering ───────────────────────────────────────────────────────────────

fn render_entries<'a>(label: &str, entries: impl Iterator<Item = &'a CapabilityEntry>) -> String {
    let lines: Vec<String> = entries
        .map(|entry| match &entry.description {
            Some(desc) => format!("- {} [{}]: {desc}", entry.name, entry.server),
            None => format!("- {} [{}]", entry.name, entry.server),
        })
        .collect();

    if lines.is_empty() {
        format!("No {label} available.")
    } else {
        format!("Available {label}:\n{}", lines.join("\n"))
    }
}

/// Interim model text and one line per tool call, in the order they happened.
///
/// `None` when the model answered without calling anything.
pub fn render_activity(outcome: &QueryOutcome) -> Option<String> {
    let mut lines = Vec::new();
    for (round, invocations) in outcome.rounds_with_invocations() {
        if let Some(text) = &round.text {
            lines.push(text.trim().to_string());
        }
        for invocation in invocations {
            let server = invocation.server.as_deref().unwrap_or("no server");
            let mut line = format!(
                "Calling tool {} on {server} with args {}",
                invocation.capability, invocation.arguments
            );
            if !invocation.is_success() {
                line.push_str(&format!(" ({})", status_label(invocation.status)));
            }
            lines.push(line);
        }
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn status_label(status: InvocationStatus) -> &'static str {
    match status {
        InvocationStatus::Success => "ok",
        InvocationStatus::ToolError => "tool error",
        InvocationStatus::UnknownCapability => "unknown tool",
        InvocationStatus::InfraError => "server unavailable",
    }
}

/// Resource bodies as text; binary bodies are summarized.
pub fn render_resource(result: &ReadResourceResult) -> String {
    let parts: Vec<String> = result
        .contents
        .iter()
        .map(|contents| match (&contents.text, &contents.blob) {
            (Some(text), _) => text.clone(),
            (None, Some(blob)) => format!(
                "[binary {} from {}, {} base64 chars]",
                contents.mime_type.as_deref().unwrap_or("data"),
                contents.uri,
                blob.len()
            ),
            (None, None) => format!("[empty resource {}]", contents.uri),
        })
        .collect();

    if parts.is_empty() {
        EMPTY_RESULT_MESSAGE.to_string()
    } else {
        parts.join("\n")
    }
}

/// Prompt messages flattened to the text the model is asked.
pub fn render_prompt(result: &GetPromptResult) -> String {
    result
        .messages
        .iter()
        .map(|message| match &message.content {
            Content::Text { text } => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| format!("{other:?}")),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
