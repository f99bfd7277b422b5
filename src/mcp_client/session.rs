//! One initialized conversation with one MCP server.
//!
//! A session owns its transport. Requests are serialized: at most one is in
//! flight per session, so responses can be matched by reading until the
//! expected ID turns up. Server-initiated `ping` requests seen meanwhile are
//! answered; anything else the server asks for is refused.
//!
//! States:
//! - `Open`: usable
//! - `Degraded`: a request timed out; the server may still answer it later,
//!   so the session refuses new calls until it is pruned
//! - `Closed`: transport released, terminal

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::transport::{extract_result, next_request_id, Transport};
use super::types::{
    error_codes, CallToolResult, Catalog, GetPromptResult, InitializeResult, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsResult, ListResourcesResult,
    ListToolsResult, ReadResourceResult, RequestId, ServerInfo, TransportKind,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default bound on the whole initialize + discovery sequence.
///
/// Generous because some servers import large frameworks at startup.
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Stop following `nextCursor` after this many pages.
const MAX_LIST_PAGES: usize = 64;

/// Name reported to servers in `clientInfo`.
const CLIENT_NAME: &str = "mcp-chatbot";

// ─── Options ─────────────────────────────────────────────────────────────────

/// Timeouts applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl SessionOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Degraded { reason: String },
    Closed,
}

/// An initialized MCP session over one transport.
pub struct Session {
    server_name: String,
    transport: Box<dyn Transport>,
    options: SessionOptions,
    in_flight: Mutex<()>,
    state: StdMutex<SessionState>,
    cancel: CancellationToken,
    protocol_version: Option<String>,
    server_info: Option<ServerInfo>,
    instructions: Option<String>,
    catalog: Catalog,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_name", &self.server_name)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

impl Session {
    /// Wrap a freshly opened transport. Call `initialize` before use.
    pub fn new(transport: Box<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            server_name: transport.server_name().to_string(),
            transport,
            options,
            in_flight: Mutex::new(()),
            state: StdMutex::new(SessionState::Open),
            cancel: CancellationToken::new(),
            protocol_version: None,
            server_info: None,
            instructions: None,
            catalog: Catalog::default(),
        }
    }

    /// Open a session and run the handshake. On failure the transport is closed
    /// before the error is returned.
    pub async fn handshake(
        transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> Result<Self, McpError> {
        let mut session = Self::new(transport, options);
        match session.initialize().await {
            Ok(()) => Ok(session),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(
                        server = %session.server_name,
                        error = %close_err,
                        "failed to close transport after handshake failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Negotiate the protocol version, send `notifications/initialized`, and
    /// discover tools, resources, and prompts for each advertised kind.
    pub async fn initialize(&mut self) -> Result<(), McpError> {
        let timeout = self.options.handshake_timeout();
        match tokio::time::timeout(timeout, self.run_handshake()).await {
            Ok(Ok((init, catalog))) => {
                tracing::info!(
                    server = %self.server_name,
                    protocol_version = %init.protocol_version,
                    tools = catalog.tools.len(),
                    resources = catalog.resources.len(),
                    prompts = catalog.prompts.len(),
                    "session initialized"
                );
                self.protocol_version = Some(init.protocol_version);
                self.server_info = init.server_info;
                self.instructions = init.instructions;
                self.catalog = catalog;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::HandshakeFailed {
                server: self.server_name.clone(),
                reason: format!("initialization timed out after {}ms", timeout.as_millis()),
            }),
        }
    }

    async fn run_handshake(&self) -> Result<(InitializeResult, Catalog), McpError> {
        let params = serde_json::json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let raw = self
            .request("initialize", Some(params))
            .await
            .map_err(|e| self.handshake_error(e))?;
        let init: InitializeResult =
            serde_json::from_value(raw).map_err(|e| McpError::HandshakeFailed {
                server: self.server_name.clone(),
                reason: format!("malformed initialize result: {e}"),
            })?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(McpError::VersionMismatch {
                server: self.server_name.clone(),
                offered: LATEST_PROTOCOL_VERSION.to_string(),
                received: init.protocol_version,
            });
        }

        self.notify("notifications/initialized", None)
            .await
            .map_err(|e| self.handshake_error(e))?;

        let mut catalog = Catalog::default();
        if init.capabilities.tools.is_some() {
            catalog.tools = self
                .list_paged("tools/list", |page: ListToolsResult| (page.tools, page.next_cursor))
                .await
                .map_err(|e| self.handshake_error(e))?;
        }
        if init.capabilities.resources.is_some() {
            catalog.resources = self
                .list_paged("resources/list", |page: ListResourcesResult| {
                    (page.resources, page.next_cursor)
                })
                .await
                .map_err(|e| self.handshake_error(e))?;
        }
        if init.capabilities.prompts.is_some() {
            catalog.prompts = self
                .list_paged("prompts/list", |page: ListPromptsResult| {
                    (page.prompts, page.next_cursor)
                })
                .await
                .map_err(|e| self.handshake_error(e))?;
        }

        Ok((init, catalog))
    }

    /// Transport failures keep their class; everything else is a handshake failure.
    fn handshake_error(&self, err: McpError) -> McpError {
        match err {
            e @ (McpError::TransportError { .. } | McpError::TransportClosed { .. }) => e,
            other => McpError::HandshakeFailed {
                server: self.server_name.clone(),
                reason: other.to_string(),
            },
        }
    }

    /// Fetch every page of a list method.
    async fn list_paged<P, T, F>(&self, method: &str, split: F) -> Result<Vec<T>, McpError>
    where
        P: DeserializeOwned,
        F: Fn(P) -> (Vec<T>, Option<String>),
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: P = self.decode(method, self.request(method, params).await?)?;
            let (page_items, next) = split(page);
            items.extend(page_items);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        tracing::warn!(
            server = %self.server_name,
            method,
            "pagination limit reached, list truncated"
        );
        Ok(items)
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Invoke a tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let raw = self.request("tools/call", Some(params)).await?;
        self.decode("tools/call", raw)
    }

    /// Read a resource by URI.
    pub async fn get_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let raw = self
            .request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await?;
        self.decode("resources/read", raw)
    }

    /// Render a prompt with string arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let raw = self.request("prompts/get", Some(params)).await?;
        self.decode("prompts/get", raw)
    }

    /// Send a request and wait for its response.
    ///
    /// A timeout degrades the session. A transport failure or end of stream
    /// closes it. Close cancels the wait.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_usable()?;

        let _guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled(method)),
            guard = self.in_flight.lock() => guard,
        };
        // state may have changed while queued behind another request
        self.ensure_usable()?;

        let timeout = self.options.request_timeout();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled(method)),
            result = tokio::time::timeout(timeout, self.round_trip(method, params)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        let err = McpError::Timeout {
                            server: self.server_name.clone(),
                            method: method.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        };
                        self.degrade(err.to_string());
                        Err(err)
                    }
                }
            }
        };

        if let Err(e) = &outcome {
            if e.invalidates_session() {
                self.invalidate(e).await;
            }
        }
        outcome
    }

    /// Send a notification. No response is expected.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_usable()?;
        let message: JsonRpcMessage = JsonRpcNotification::new(method, params).into();
        let result = self.transport.send(&message).await;
        if let Err(e) = &result {
            if e.invalidates_session() {
                self.invalidate(e).await;
            }
        }
        result
    }

    async fn round_trip(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = next_request_id();
        let expected = RequestId::Number(id);
        let message: JsonRpcMessage = JsonRpcRequest::new(id, method, params).into();
        self.transport.send(&message).await?;

        loop {
            match self.transport.receive().await? {
                None => {
                    return Err(McpError::TransportError {
                        server: self.server_name.clone(),
                        reason: format!("connection closed while waiting for '{method}'"),
                    });
                }
                Some(JsonRpcMessage::Response(response))
                    if response.id.as_ref() == Some(&expected) =>
                {
                    return extract_result(response);
                }
                Some(JsonRpcMessage::Response(response)) => {
                    tracing::debug!(
                        server = %self.server_name,
                        id = ?response.id,
                        "discarding stale response"
                    );
                }
                Some(JsonRpcMessage::Request(request)) => {
                    let reply = if request.method == "ping" {
                        JsonRpcResponse::success(request.id, serde_json::json!({}))
                    } else {
                        tracing::debug!(
                            server = %self.server_name,
                            method = %request.method,
                            "refusing server request"
                        );
                        JsonRpcResponse::failure(
                            request.id,
                            error_codes::METHOD_NOT_FOUND,
                            &format!("client does not support '{}'", request.method),
                        )
                    };
                    self.transport.send(&reply.into()).await?;
                }
                Some(JsonRpcMessage::Notification(notification)) => {
                    tracing::debug!(
                        server = %self.server_name,
                        method = %notification.method,
                        "server notification"
                    );
                }
            }
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        method: &str,
        raw: serde_json::Value,
    ) -> Result<T, McpError> {
        serde_json::from_value(raw).map_err(|e| McpError::ServerError {
            code: error_codes::INTERNAL_ERROR,
            message: format!("malformed '{method}' result from '{}': {e}", self.server_name),
            data: None,
        })
    }

    // ─── State ───────────────────────────────────────────────────────────

    fn state_guard(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_usable(&self) -> Result<(), McpError> {
        match &*self.state_guard() {
            SessionState::Open => Ok(()),
            SessionState::Degraded { reason } => Err(McpError::SessionDegraded {
                server: self.server_name.clone(),
                reason: reason.clone(),
            }),
            SessionState::Closed => Err(McpError::SessionClosed {
                server: self.server_name.clone(),
            }),
        }
    }

    fn cancelled(&self, method: &str) -> McpError {
        McpError::Cancelled {
            server: self.server_name.clone(),
            method: method.to_string(),
        }
    }

    fn degrade(&self, reason: String) {
        let mut state = self.state_guard();
        if *state == SessionState::Open {
            tracing::warn!(server = %self.server_name, reason = %reason, "session degraded");
            *state = SessionState::Degraded { reason };
        }
    }

    async fn invalidate(&self, cause: &McpError) {
        let was_closed = {
            let mut state = self.state_guard();
            std::mem::replace(&mut *state, SessionState::Closed) == SessionState::Closed
        };
        if !was_closed {
            tracing::warn!(server = %self.server_name, error = %cause, "session invalidated");
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(
                server = %self.server_name,
                error = %e,
                "transport close after failure failed"
            );
        }
    }

    /// Cancel any waiting request and release the transport. Idempotent.
    pub async fn close(&self) -> Result<(), McpError> {
        {
            let mut state = self.state_guard();
            *state = SessionState::Closed;
        }
        self.cancel.cancel();
        self.transport.close().await
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn state(&self) -> SessionState {
        self.state_guard().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state_guard(), SessionState::Open)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
