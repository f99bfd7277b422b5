//! Capability table — tools, resources, and prompts across all sessions.
//!
//! Provides:
//! - Lookup by `(kind, name)`; resources are keyed by URI
//! - First-registered-wins collision policy with diagnostics
//! - Validation that a tool call supplies the schema's required fields
//! - A compact capability summary for banners and prompts
//!
//! Entries hold `Weak` session references: the registry owns sessions, the
//! table only routes to them. Tables are immutable once built and swapped
//! whole, so readers never see a half-updated view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use super::errors::McpError;
use super::session::{Session, SessionState};
use super::types::CapabilityKind;

// ─── Entries ─────────────────────────────────────────────────────────────────

/// One routable capability.
#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub kind: CapabilityKind,
    /// Tool or prompt name, or resource URI.
    pub name: String,
    pub description: Option<String>,
    /// Tool input schema, prompt argument list, or resource metadata.
    pub schema: serde_json::Value,
    /// Name of the server that provides it.
    pub server: String,
    session: Weak<Session>,
}

impl CapabilityEntry {
    /// The owning session, if it is still registered.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }
}

/// Recorded when two servers expose the same `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionDiagnostic {
    pub kind: CapabilityKind,
    pub name: String,
    /// Server whose entry is routed to.
    pub kept: String,
    /// Server whose entry was ignored.
    pub shadowed: String,
}

// ─── CapabilityTable ─────────────────────────────────────────────────────────

/// Immutable snapshot of every capability, in registration order.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    entries: Vec<CapabilityEntry>,
    index: HashMap<(CapabilityKind, String), usize>,
    collisions: Vec<CollisionDiagnostic>,
}

impl CapabilityTable {
    /// Build a table from open sessions, in the order given.
    pub fn build(sessions: &[Arc<Session>]) -> Self {
        let mut table = Self::default();

        for session in sessions.iter().filter(|s| s.is_open()) {
            let catalog = session.catalog();
            for tool in &catalog.tools {
                let description = (!tool.description.is_empty()).then(|| tool.description.clone());
                table.insert(
                    session,
                    CapabilityKind::Tool,
                    &tool.name,
                    description,
                    tool.params_schema.clone(),
                );
            }
            for resource in &catalog.resources {
                let schema =
                    serde_json::json!({ "name": resource.name, "mimeType": resource.mime_type });
                table.insert(
                    session,
                    CapabilityKind::Resource,
                    &resource.uri,
                    resource.description.clone(),
                    schema,
                );
            }
            for prompt in &catalog.prompts {
                let schema = serde_json::to_value(&prompt.arguments).unwrap_or_default();
                table.insert(
                    session,
                    CapabilityKind::Prompt,
                    &prompt.name,
                    prompt.description.clone(),
                    schema,
                );
            }
        }

        table
    }

    fn insert(
        &mut self,
        session: &Arc<Session>,
        kind: CapabilityKind,
        name: &str,
        description: Option<String>,
        schema: serde_json::Value,
    ) {
        let key = (kind, name.to_string());
        if let Some(&existing) = self.index.get(&key) {
            let diagnostic = CollisionDiagnostic {
                kind,
                name: name.to_string(),
                kept: self.entries[existing].server.clone(),
                shadowed: session.server_name().to_string(),
            };
            tracing::warn!(
                kind = %diagnostic.kind,
                name = %diagnostic.name,
                kept = %diagnostic.kept,
                shadowed = %diagnostic.shadowed,
                "capability name collision, keeping first registration"
            );
            self.collisions.push(diagnostic);
            return;
        }

        self.index.insert(key, self.entries.len());
        self.entries.push(CapabilityEntry {
            kind,
            name: name.to_string(),
            description,
            schema,
            server: session.server_name().to_string(),
            session: Arc::downgrade(session),
        });
    }

    /// Look up an entry.
    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<&CapabilityEntry> {
        self.index
            .get(&(kind, name.to_string()))
            .map(|&i| &self.entries[i])
    }

    /// Resolve a capability to the session that serves it.
    pub fn resolve(&self, kind: CapabilityKind, name: &str) -> Result<Arc<Session>, McpError> {
        let entry = self.get(kind, name).ok_or_else(|| McpError::UnknownCapability {
            kind,
            name: name.to_string(),
        })?;

        match entry.session() {
            Some(session) if session.state() != SessionState::Closed => Ok(session),
            _ => Err(McpError::SessionClosed {
                server: entry.server.clone(),
            }),
        }
    }

    /// Entries of one kind, in registration order.
    pub fn entries(&self, kind: CapabilityKind) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn tools(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries(CapabilityKind::Tool)
    }

    pub fn resources(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries(CapabilityKind::Resource)
    }

    pub fn prompts(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries(CapabilityKind::Prompt)
    }

    pub fn count(&self, kind: CapabilityKind) -> usize {
        self.entries(kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collisions detected while building this table.
    pub fn collisions(&self) -> &[CollisionDiagnostic] {
        &self.collisions
    }

    /// Servers that contributed at least one entry, in registration order.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !names.contains(&entry.server) {
                names.push(entry.server.clone());
            }
        }
        names
    }

    /// Validate a tool call: tool exists and arguments carry every required field.
    ///
    /// Full JSON Schema validation is left to the server.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let entry = self
            .get(CapabilityKind::Tool, tool_name)
            .ok_or_else(|| McpError::UnknownCapability {
                kind: CapabilityKind::Tool,
                name: tool_name.to_string(),
            })?;

        if !arguments.is_object() && !arguments.is_null() {
            return Err(McpError::InvalidArguments {
                tool: tool_name.to_string(),
                reason: "arguments must be a JSON object".into(),
            });
        }

        if let Some(required) = entry.schema.get("required").and_then(|r| r.as_array()) {
            let args_obj = arguments.as_object();
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                let has_field = args_obj.map(|obj| obj.contains_key(field_name)).unwrap_or(false);
                if !has_field {
                    return Err(McpError::InvalidArguments {
                        tool: tool_name.to_string(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }

    /// One-paragraph summary: servers with their tool counts.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No MCP capabilities currently available.".to_string();
        }

        let server_parts: Vec<String> = self
            .server_names()
            .iter()
            .map(|name| {
                let tools = self.tools().filter(|e| &e.server == name).count();
                format!("{name} ({tools})")
            })
            .collect();

        format!(
            "Available capabilities ({} tools, {} resources, {} prompts across {} servers): {}.",
            self.count(CapabilityKind::Tool),
            self.count(CapabilityKind::Resource),
            self.count(CapabilityKind::Prompt),
            server_parts.len(),
            server_parts.join(", "),
        )
    }
}

// ─── CapabilityAggregator ────────────────────────────────────────────────────

/// Holds the current table and swaps in rebuilt ones.
#[derive(Debug, Default)]
pub struct CapabilityAggregator {
    current: RwLock<Arc<CapabilityTable>>,
}

impl CapabilityAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table as of now. Later rebuilds do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<CapabilityTable> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Rebuild from the given sessions and publish the result.
    pub fn rebuild(&self, sessions: &[Arc<Session>]) -> Arc<CapabilityTable> {
        let table = Arc::new(CapabilityTable::build(sessions));
        tracing::debug!(
            entries = table.len(),
            collisions = table.collisions().len(),
            "capability table rebuilt"
        );
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&table);
        table
    }

    /// Publish an empty table.
    pub fn clear(&self) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Arc::new(CapabilityTable::default());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::session::SessionOptions;
    use crate::mcp_client::testing::{MockLog, MockServer, MockTransport};

    async fn session(server: MockServer, log: &Arc<MockLog>) -> Arc<Session> {
        let transport = MockTransport::new(server, Arc::clone(log));
        Arc::new(
            Session::handshake(Box::new(transport), SessionOptions::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_collision_first_registered_wins() {
        let log = MockLog::new();
        let web = session(MockServer::new("web").with_tools(&["search", "fetch"]), &log).await;
        let docs = session(MockServer::new("docs").with_tools(&["search"]), &log).await;

        let table = CapabilityTable::build(&[Arc::clone(&web), Arc::clone(&docs)]);

        let resolved = table.resolve(CapabilityKind::Tool, "search").unwrap();
        assert_eq!(resolved.server_name(), "web");
        assert_eq!(table.count(CapabilityKind::Tool), 2);
        assert_eq!(
            table.collisions(),
            &[CollisionDiagnostic {
                kind: CapabilityKind::Tool,
                name: "search".into(),
                kept: "web".into(),
                shadowed: "docs".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_kinds_do_not_collide() {
        let log = MockLog::new();
        let a = session(MockServer::new("a").with_tools(&["notes"]), &log).await;
        let b = session(MockServer::new("b").with_prompt("notes"), &log).await;

        let table = CapabilityTable::build(&[a, b]);
        assert!(table.collisions().is_empty());
        assert_eq!(table.resolve(CapabilityKind::Prompt, "notes").unwrap().server_name(), "b");
    }

    #[tokio::test]
    async fn test_resources_keyed_by_uri() {
        let log = MockLog::new();
        let files = session(MockServer::new("files").with_resource("file:///a.txt"), &log).await;

        let table = CapabilityTable::build(&[files]);
        let entry = table.get(CapabilityKind::Resource, "file:///a.txt").unwrap();
        assert_eq!(entry.server, "files");
        assert_eq!(entry.schema["mimeType"], "text/plain");
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let table = CapabilityTable::default();
        let err = table.resolve(CapabilityKind::Tool, "nope").unwrap_err();
        assert!(matches!(err, McpError::UnknownCapability { kind: CapabilityKind::Tool, .. }));
    }

    #[tokio::test]
    async fn test_dropped_session_resolves_to_session_closed() {
        let log = MockLog::new();
        let gone = session(MockServer::new("gone").with_tools(&["ping"]), &log).await;
        let table = CapabilityTable::build(&[Arc::clone(&gone)]);

        gone.close().await.unwrap();
        assert!(matches!(
            table.resolve(CapabilityKind::Tool, "ping"),
            Err(McpError::SessionClosed { ref server }) if server == "gone"
        ));

        drop(gone);
        assert!(matches!(
            table.resolve(CapabilityKind::Tool, "ping"),
            Err(McpError::SessionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_sessions_are_excluded_from_build() {
        let log = MockLog::new();
        let a = session(MockServer::new("a").with_tools(&["x"]), &log).await;
        let b = session(MockServer::new("b").with_tools(&["x"]), &log).await;
        a.close().await.unwrap();

        let table = CapabilityTable::build(&[a, b]);
        assert_eq!(table.resolve(CapabilityKind::Tool, "x").unwrap().server_name(), "b");
        assert!(table.collisions().is_empty());
    }

    #[tokio::test]
    async fn test_validate_tool_call_required_fields() {
        let log = MockLog::new();
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"],
        });
        let fs = session(MockServer::new("fs").with_tool_schema("read_file", schema), &log).await;
        let table = CapabilityTable::build(&[fs]);

        assert!(table
            .validate_tool_call("read_file", &serde_json::json!({"path": "/tmp/a"}))
            .is_ok());
        assert!(matches!(
            table.validate_tool_call("read_file", &serde_json::json!({})),
            Err(McpError::InvalidArguments { .. })
        ));
        assert!(matches!(
            table.validate_tool_call("read_file", &serde_json::json!("path")),
            Err(McpError::InvalidArguments { .. })
        ));
        assert!(matches!(
            table.validate_tool_call("write_file", &serde_json::json!({})),
            Err(McpError::UnknownCapability { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregator_snapshot_is_stable_across_rebuild() {
        let log = MockLog::new();
        let a = session(MockServer::new("a").with_tools(&["one"]), &log).await;
        let aggregator = CapabilityAggregator::new();

        aggregator.rebuild(&[Arc::clone(&a)]);
        let before = aggregator.snapshot();
        aggregator.clear();

        assert_eq!(before.len(), 1);
        assert!(aggregator.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_capability_summary() {
        let log = MockLog::new();
        let a = session(MockServer::new("a").with_tools(&["one", "two"]), &log).await;
        let table = CapabilityTable::build(&[a]);
        let summary = table.capability_summary();
        assert!(summary.contains("2 tools"));
        assert!(summary.contains("a (2)"));

        assert!(CapabilityTable::default()
            .capability_summary()
            .contains("No MCP capabilities"));
    }
}
