//! Connection registry — owns every live session, in registration order.
//!
//! Handles:
//! - Startup: connect each configured server in order under a `StartupPolicy`
//! - Rollback: a failed registration or aborted startup leaves nothing open
//! - Removal and pruning of closed or degraded sessions
//! - Shutdown: close in reverse registration order, past individual failures

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::errors::McpError;
use super::session::{Session, SessionOptions};
use super::transport::{Connector, DefaultConnector};
use super::types::ServerDescriptor;

// ─── Policy & Reports ────────────────────────────────────────────────────────

/// What startup does when a non-required server fails to connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPolicy {
    /// Log the failure and carry on with the remaining servers.
    #[default]
    Continue,
    /// Unwind everything connected so far and fail startup.
    AbortOnFirstFailure,
}

/// Outcome of `connect_all` when startup was not aborted.
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Servers now registered, in order.
    pub connected: Vec<String>,
    /// Servers skipped, with the reason.
    pub failed: Vec<(String, McpError)>,
}

/// One session closed during shutdown or removal.
#[derive(Debug)]
pub struct ClosedServer {
    pub name: String,
    pub closed_at: DateTime<Utc>,
    pub error: Option<McpError>,
}

/// Every close attempted, in the order performed.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub closed: Vec<ClosedServer>,
}

impl ShutdownReport {
    /// Server names in close order.
    pub fn order(&self) -> Vec<&str> {
        self.closed.iter().map(|c| c.name.as_str()).collect()
    }

    /// Closes that reported an error.
    pub fn failures(&self) -> impl Iterator<Item = &ClosedServer> {
        self.closed.iter().filter(|c| c.error.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

/// A registered server: descriptor, its session, and when it connected.
#[derive(Debug)]
pub struct RegisteredServer {
    pub descriptor: ServerDescriptor,
    pub session: Arc<Session>,
    pub connected_at: DateTime<Utc>,
}

/// Owns all sessions. Registration order is preserved for teardown.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    servers: Vec<RegisteredServer>,
}

impl ConnectionRegistry {
    /// Registry using the real transports.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_connector(Arc::new(DefaultConnector::new()), options)
    }

    /// Registry with a custom transport factory.
    pub fn with_connector(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            connector,
            options,
            servers: Vec::new(),
        }
    }

    /// Open, handshake, and register one server.
    ///
    /// Either the server ends up registered with an open session, or every
    /// resource acquired for it has been released and an error is returned.
    pub async fn add_server(
        &mut self,
        descriptor: ServerDescriptor,
    ) -> Result<Arc<Session>, McpError> {
        if self.contains(&descriptor.name) {
            return Err(McpError::DuplicateServer {
                name: descriptor.name.clone(),
            });
        }

        let transport = self.connector.open(&descriptor).await?;
        let session = Arc::new(Session::handshake(transport, self.options).await?);

        tracing::info!(
            server = %descriptor.name,
            transport = %descriptor.kind(),
            tools = session.catalog().tools.len(),
            "server registered"
        );

        self.servers.push(RegisteredServer {
            descriptor,
            session: Arc::clone(&session),
            connected_at: Utc::now(),
        });
        Ok(session)
    }

    /// Connect every descriptor in order.
    ///
    /// A failing `required` server always aborts. Otherwise the policy decides.
    /// On abort, servers registered by this call are closed in reverse order
    /// before the error is returned.
    pub async fn connect_all(
        &mut self,
        descriptors: &[ServerDescriptor],
        policy: StartupPolicy,
    ) -> Result<StartupReport, McpError> {
        let baseline = self.servers.len();
        let mut report = StartupReport::default();

        for descriptor in descriptors {
            match self.add_server(descriptor.clone()).await {
                Ok(_) => report.connected.push(descriptor.name.clone()),
                Err(e) => {
                    let abort = descriptor.required || policy == StartupPolicy::AbortOnFirstFailure;
                    if abort {
                        tracing::error!(
                            server = %descriptor.name,
                            required = descriptor.required,
                            error = %e,
                            "server failed to start, aborting startup"
                        );
                        let unwound = self.close_from(baseline).await;
                        tracing::info!(closed = unwound.closed.len(), "startup unwound");
                        return Err(e);
                    }
                    tracing::warn!(
                        server = %descriptor.name,
                        error = %e,
                        "server failed to start, continuing"
                    );
                    report.failed.push((descriptor.name.clone(), e));
                }
            }
        }

        tracing::info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "startup complete"
        );
        Ok(report)
    }

    /// Close every session, newest first. Never stops early.
    pub async fn shutdown_all(&mut self) -> ShutdownReport {
        let report = self.close_from(0).await;
        tracing::info!(
            closed = report.closed.len(),
            failures = report.failures().count(),
            "all servers shut down"
        );
        report
    }

    /// Unregister a server without closing it.
    ///
    /// Callers must drop its capabilities before closing it.
    pub(crate) fn detach(&mut self, name: &str) -> Option<RegisteredServer> {
        let pos = self.servers.iter().position(|s| s.descriptor.name == name)?;
        Some(self.servers.remove(pos))
    }

    /// Unregister every server whose session is closed or degraded, preserving order.
    pub(crate) fn detach_unavailable(&mut self) -> Vec<RegisteredServer> {
        let (unavailable, available): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.servers).into_iter().partition(|s| !s.session.is_open());
        self.servers = available;
        unavailable
    }

    /// Sessions in registration order.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.servers.iter().map(|s| Arc::clone(&s.session)).collect()
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.servers
            .iter()
            .find(|s| s.descriptor.name == name)
            .map(|s| Arc::clone(&s.session))
    }

    pub fn servers(&self) -> &[RegisteredServer] {
        &self.servers
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.descriptor.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.iter().any(|s| s.descriptor.name == name)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Close and unregister every server at index `start` or later.
    async fn close_from(&mut self, start: usize) -> ShutdownReport {
        let start = start.min(self.servers.len());
        let tail: Vec<RegisteredServer> = self.servers.drain(start..).collect();
        close_servers(tail).await
    }
}

/// Close the given servers in reverse order, recording each outcome.
pub(crate) async fn close_servers(servers: Vec<RegisteredServer>) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for server in servers.into_iter().rev() {
        let name = server.descriptor.name;
        let error = match server.session.close().await {
            Ok(()) => {
                tracing::debug!(server = %name, "server closed");
                None
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "server close failed");
                Some(e)
            }
        };
        report.closed.push(ClosedServer {
            name,
            closed_at: Utc::now(),
            error,
        });
    }

    report
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::session::SessionState;
    use crate::mcp_client::testing::{MockConnector, MockLog, MockServer};

    fn registry(connector: MockConnector) -> ConnectionRegistry {
        let options = SessionOptions {
            request_timeout_ms: 100,
            handshake_timeout_ms: 500,
        };
        ConnectionRegistry::with_connector(Arc::new(connector), options)
    }

    fn servers(names: &[&str]) -> Vec<MockServer> {
        names.iter().map(|n| MockServer::new(n).with_tools(&["echo"])).collect()
    }

    fn connector_for(log: &Arc<MockLog>, servers: &[MockServer]) -> MockConnector {
        servers
            .iter()
            .cloned()
            .fold(MockConnector::new(log), |c, s| c.with_server(s))
    }

    #[tokio::test]
    async fn test_continue_policy_skips_failures() {
        let log = MockLog::new();
        let all = servers(&["a", "b", "c", "d"]);
        let connector = connector_for(&log, &all).refusing("b").refusing("d");
        let mut registry = registry(connector);

        let descriptors: Vec<_> = all.iter().map(|s| s.descriptor()).collect();
        let report = registry.connect_all(&descriptors, StartupPolicy::Continue).await.unwrap();

        assert_eq!(report.connected, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(registry.server_names(), vec!["a", "c"]);
        assert_eq!(log.live(), 2);

        registry.shutdown_all().await;
        assert_eq!(log.live(), 0);
    }

    #[tokio::test]
    async fn test_handshake_failure_releases_transport() {
        let log = MockLog::new();
        let ok = MockServer::new("ok").with_tools(&["echo"]);
        let bad = MockServer::new("bad").failing_initialize();
        let mut registry = registry(connector_for(&log, &[ok.clone(), bad.clone()]));

        let report = registry
            .connect_all(&[ok.descriptor(), bad.descriptor()], StartupPolicy::Continue)
            .await
            .unwrap();

        assert_eq!(report.connected, vec!["ok"]);
        assert!(matches!(report.failed[0].1, McpError::HandshakeFailed { .. }));
        assert_eq!(log.opened(), 2);
        assert_eq!(log.live(), 1);
    }

    #[tokio::test]
    async fn test_abort_policy_unwinds_in_reverse() {
        let log = MockLog::new();
        let all = servers(&["a", "b", "c"]);
        let connector = connector_for(&log, &all).refusing("c");
        let mut registry = registry(connector);

        let descriptors: Vec<_> = all.iter().map(|s| s.descriptor()).collect();
        let err = registry
            .connect_all(&descriptors, StartupPolicy::AbortOnFirstFailure)
            .await
            .unwrap_err();

        assert!(matches!(err, McpError::ConnectFailed { ref server, .. } if server == "c"));
        assert!(registry.is_empty());
        assert_eq!(log.live(), 0);
        assert_eq!(log.close_order(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_required_server_aborts_under_continue() {
        let log = MockLog::new();
        let all = servers(&["a", "critical"]);
        let connector = connector_for(&log, &all).refusing("critical");
        let mut registry = registry(connector);

        let mut critical = all[1].descriptor();
        critical.required = true;
        let result = registry
            .connect_all(&[all[0].descriptor(), critical], StartupPolicy::Continue)
            .await;

        assert!(result.is_err());
        assert_eq!(log.live(), 0);
    }

    #[tokio::test]
    async fn test_abort_keeps_servers_from_earlier_calls() {
        let log = MockLog::new();
        let all = servers(&["early", "late"]);
        let connector = connector_for(&log, &all).refusing("late");
        let mut registry = registry(connector);

        registry.add_server(all[0].descriptor()).await.unwrap();
        let result = registry
            .connect_all(&[all[1].descriptor()], StartupPolicy::AbortOnFirstFailure)
            .await;

        assert!(result.is_err());
        assert_eq!(registry.server_names(), vec!["early"]);
        assert_eq!(log.live(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reverse_order_with_timestamps() {
        let log = MockLog::new();
        let all = servers(&["A", "B", "C"]);
        let mut registry = registry(connector_for(&log, &all));
        let descriptors: Vec<_> = all.iter().map(|s| s.descriptor()).collect();
        registry.connect_all(&descriptors, StartupPolicy::Continue).await.unwrap();

        let report = registry.shutdown_all().await;

        assert_eq!(report.order(), vec!["C", "B", "A"]);
        assert!(report.is_clean());
        assert!(report.closed.windows(2).all(|w| w[0].closed_at <= w[1].closed_at));
        let times = log.close_times();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(log.close_order(), vec!["C", "B", "A"]);
        assert!(registry.is_empty());
        assert_eq!(log.live(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_without_opening() {
        let log = MockLog::new();
        let all = servers(&["dup"]);
        let mut registry = registry(connector_for(&log, &all));

        registry.add_server(all[0].descriptor()).await.unwrap();
        let err = registry.add_server(all[0].descriptor()).await.unwrap_err();

        assert!(matches!(err, McpError::DuplicateServer { .. }));
        assert_eq!(log.opened(), 1);
    }

    #[tokio::test]
    async fn test_detach_unavailable_keeps_healthy_order() {
        let log = MockLog::new();
        let all = servers(&["healthy", "flaky"]);
        let mut registry = registry(connector_for(&log, &all));
        let descriptors: Vec<_> = all.iter().map(|s| s.descriptor()).collect();
        registry.connect_all(&descriptors, StartupPolicy::Continue).await.unwrap();

        log.disconnect("flaky");
        let flaky = registry.session("flaky").unwrap();
        assert!(flaky.call_tool("echo", serde_json::json!({})).await.is_err());
        assert_eq!(flaky.state(), SessionState::Closed);

        let detached = registry.detach_unavailable();
        assert_eq!(registry.server_names(), vec!["healthy"]);

        let report = close_servers(detached).await;
        assert_eq!(report.order(), vec!["flaky"]);
        assert_eq!(log.live(), 1);
    }

    #[tokio::test]
    async fn test_detach_unknown_server() {
        let log = MockLog::new();
        let mut registry = registry(MockConnector::new(&log));
        assert!(registry.detach("missing").is_none());
    }
}
