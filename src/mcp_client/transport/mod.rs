//! Message transports to MCP servers.
//!
//! Every transport owns exactly one OS or network resource and moves whole
//! JSON-RPC messages:
//! - `stdio`: child process, newline-delimited JSON over stdin/stdout
//! - `sse`: GET event stream for server→client, POST endpoint for client→server
//! - `streamable_http`: one URL, POST per message, JSON or SSE response bodies
//!
//! `close()` is idempotent on every transport. The first unrecoverable I/O
//! error also releases the resource; later calls fail with `TransportClosed`.

pub mod event_stream;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

#[cfg(test)]
pub(crate) mod test_http;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::errors::McpError;
use super::types::{
    JsonRpcMessage, JsonRpcResponse, ServerDescriptor, TransportConfig, TransportKind,
};

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout for HTTP transports.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// A bidirectional message channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the server this transport talks to.
    fn server_name(&self) -> &str;

    /// Which transport variant this is.
    fn kind(&self) -> TransportKind;

    /// Send one message.
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError>;

    /// Receive the next message. `Ok(None)` means the server ended the stream.
    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpError>;

    /// Release the underlying resource. Safe to call any number of times.
    async fn close(&self) -> Result<(), McpError>;

    /// Whether the transport has been closed or invalidated.
    fn is_closed(&self) -> bool;
}

/// Opens transports for server descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Transport>, McpError>;
}

/// Opens the real transport for each descriptor kind.
#[derive(Clone)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    /// Create a connector with a shared HTTP client.
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build tuned HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { http }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Transport>, McpError> {
        let name = descriptor.name.as_str();
        tracing::debug!(server = name, transport = %descriptor.kind(), "opening transport");

        match &descriptor.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let cwd = cwd.as_deref().map(Path::new);
                let transport = StdioTransport::spawn(name, command, args, env, cwd)?;
                Ok(Box::new(transport))
            }
            TransportConfig::Sse { url, headers } => {
                let transport = SseTransport::connect(name, self.http.clone(), url, headers).await?;
                Ok(Box::new(transport))
            }
            TransportConfig::StreamableHttp { url, headers } => {
                let transport =
                    StreamableHttpTransport::connect(name, self.http.clone(), url, headers)?;
                Ok(Box::new(transport))
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Convert configured static headers into a `HeaderMap`.
pub(crate) fn build_headers(
    server: &str,
    headers: &HashMap<String, String>,
) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::ConnectFailed {
            server: server.to_string(),
            reason: format!("invalid header name '{key}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::ConnectFailed {
            server: server.to_string(),
            reason: format!("invalid value for header '{key}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
