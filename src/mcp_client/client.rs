//! MCP Client — high-level interface over all connected servers.
//!
//! Keeps the connection registry and the capability table in step: every
//! change to the set of sessions republishes the table, and removals purge
//! the table before the session is closed so nothing routes to a dying server.

use std::collections::HashMap;
use std::sync::Arc;

use super::capabilities::{CapabilityAggregator, CapabilityTable};
use super::errors::McpError;
use super::registry::{
    close_servers, ConnectionRegistry, ShutdownReport, StartupPolicy, StartupReport,
};
use super::session::SessionOptions;
use super::transport::Connector;
use super::types::{
    CallToolResult, CapabilityKind, GetPromptResult, ReadResourceResult, ServerDescriptor,
};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Multi-server MCP client that routes calls by capability name.
pub struct McpClient {
    registry: ConnectionRegistry,
    capabilities: CapabilityAggregator,
}

impl McpClient {
    /// Client using the real transports.
    pub fn new(options: SessionOptions) -> Self {
        Self {
            registry: ConnectionRegistry::new(options),
            capabilities: CapabilityAggregator::new(),
        }
    }

    /// Client with a custom transport factory.
    pub fn with_connector(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            registry: ConnectionRegistry::with_connector(connector, options),
            capabilities: CapabilityAggregator::new(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect all configured servers and publish their capabilities.
    pub async fn connect_all(
        &mut self,
        servers: &[ServerDescriptor],
        policy: StartupPolicy,
    ) -> Result<StartupReport, McpError> {
        let result = self.registry.connect_all(servers, policy).await;
        self.refresh();
        result
    }

    /// Connect one more server.
    pub async fn add_server(&mut self, descriptor: ServerDescriptor) -> Result<(), McpError> {
        self.registry.add_server(descriptor).await?;
        self.refresh();
        Ok(())
    }

    /// Remove one server: purge its capabilities, then close its session.
    pub async fn remove_server(&mut self, name: &str) -> Result<(), McpError> {
        let server = self.registry.detach(name).ok_or_else(|| McpError::ConfigError {
            reason: format!("server '{name}' is not registered"),
        })?;
        self.refresh();

        let report = close_servers(vec![server]).await;
        match report.closed.into_iter().next().and_then(|c| c.error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop servers whose sessions are closed or degraded. Returns their names.
    pub async fn prune_unavailable(&mut self) -> Vec<String> {
        let unavailable = self.registry.detach_unavailable();
        if unavailable.is_empty() {
            return Vec::new();
        }
        self.refresh();

        let report = close_servers(unavailable).await;
        let names: Vec<String> = report.closed.into_iter().map(|c| c.name).collect();
        tracing::info!(servers = ?names, "pruned unavailable servers");
        names
    }

    /// Close every server in reverse registration order.
    pub async fn shutdown_all(&mut self) -> ShutdownReport {
        self.capabilities.clear();
        self.registry.shutdown_all().await
    }

    fn refresh(&self) {
        self.capabilities.rebuild(&self.registry.sessions());
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Current capability table.
    pub fn capabilities(&self) -> Arc<CapabilityTable> {
        self.capabilities.snapshot()
    }

    /// Validate and route a tool call.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let table = self.capabilities();
        table.validate_tool_call(name, &arguments)?;
        let session = table.resolve(CapabilityKind::Tool, name)?;
        session.call_tool(name, arguments).await
    }

    /// Read a resource from whichever server exposes its URI.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let session = self.capabilities().resolve(CapabilityKind::Resource, uri)?;
        session.get_resource(uri).await
    }

    /// Render a prompt from whichever server exposes it.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let session = self.capabilities().resolve(CapabilityKind::Prompt, name)?;
        session.get_prompt(name, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn running_server_count(&self) -> usize {
        self.registry.len()
    }

    pub fn running_servers(&self) -> Vec<String> {
        self.registry.server_names()
    }

    pub fn is_server_running(&self, name: &str) -> bool {
        self.registry
            .session(name)
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    pub fn tool_count(&self) -> usize {
        self.capabilities().count(CapabilityKind::Tool)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
