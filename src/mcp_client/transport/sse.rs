//! Legacy HTTP+SSE transport.
//!
//! The client opens a long-lived GET event stream. The server's first event is
//! `endpoint`, carrying the URL that client messages are POSTed to; responses
//! come back as `message` events on the stream.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::Url;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event_stream::{pump_events, SseEvent};
use super::{build_headers, Transport};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{JsonRpcMessage, TransportKind};

/// How long to wait for the `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

type Inbound = Result<JsonRpcMessage, McpError>;

/// JSON-RPC transport over a GET event stream plus a POST endpoint.
pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn connect(
        server_name: &str,
        http: reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let connect_err = |reason: String| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason,
        };

        let base = Url::parse(url).map_err(|e| connect_err(format!("invalid url '{url}': {e}")))?;
        let headers = build_headers(server_name, headers)?;

        let response = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| connect_err(format!("event stream request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(connect_err(format!("event stream returned HTTP {status}")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_events(
            server_name.to_string(),
            base,
            response,
            tx,
            endpoint_tx,
            cancel.clone(),
        ));

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                cancel.cancel();
                reader.abort();
                return Err(connect_err("event stream ended before the endpoint event".into()));
            }
            Err(_) => {
                cancel.cancel();
                reader.abort();
                return Err(connect_err(format!(
                    "no endpoint event within {}s",
                    ENDPOINT_TIMEOUT.as_secs()
                )));
            }
        };

        tracing::info!(server = server_name, endpoint = %endpoint, "sse transport connected");

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            endpoint,
            headers,
            inbound: Mutex::new(rx),
            reader: StdMutex::new(Some(reader)),
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// The URL client messages are POSTed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_name.clone(),
        }
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }

    fn fail(&self, reason: String) -> McpError {
        tracing::warn!(server = %self.server_name, reason = %reason, "sse transport failed");
        self.release();
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let request = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(message)
            .send();

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.closed_error()),
            response = request => response,
        };

        let response = response.map_err(|e| self.fail(format!("POST failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.fail(format!("POST returned HTTP {status}: {body}")));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let next = self.inbound.lock().await.recv().await;
        match next {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.release();
                Err(e)
            }
            None => {
                tracing::debug!(server = %self.server_name, "event stream ended");
                self.release();
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.release();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── Event Reader ────────────────────────────────────────────────────────────

/// Resolve an announced endpoint against the stream URL. Cross-origin
/// endpoints are refused.
fn resolve_endpoint(base: &Url, announced: &str) -> Result<Url, String> {
    let endpoint = base
        .join(announced.trim())
        .map_err(|e| format!("invalid endpoint '{announced}': {e}"))?;
    if endpoint.origin() != base.origin() {
        return Err(format!("endpoint '{endpoint}' is not on the stream's origin"));
    }
    Ok(endpoint)
}

async fn read_events(
    server: String,
    base: Url,
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<Inbound>,
    endpoint_tx: oneshot::Sender<Url>,
    cancel: CancellationToken,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let events_tx = tx.clone();
    let events_server = server.clone();

    let on_event = move |event: SseEvent| {
        match event.event.as_str() {
            "endpoint" => match resolve_endpoint(&base, &event.data) {
                Ok(url) => {
                    if let Some(sender) = endpoint_tx.take() {
                        let _ = sender.send(url);
                    }
                }
                Err(reason) => tracing::warn!(
                    server = %events_server,
                    reason = %reason,
                    "ignoring endpoint event"
                ),
            },
            "message" => match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                Ok(message) => {
                    if events_tx.send(Ok(message)).is_err() {
                        return ControlFlow::Break(());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        server = %events_server,
                        error = %e,
                        "skipping malformed message event"
                    );
                }
            },
            other => tracing::debug!(server = %events_server, event = other, "ignoring event"),
        }
        ControlFlow::Continue(())
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = pump_events(response, on_event) => {
            if let Err(reason) = result {
                let _ = tx.send(Err(McpError::TransportError { server, reason }));
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::transport::test_http;

    async fn connect(url: &str) -> Result<SseTransport, McpError> {
        SseTransport::connect("legacy", reqwest::Client::new(), url, &HashMap::new()).await
    }

    #[test]
    fn test_resolve_relative_endpoint() {
        let base = Url::parse("http://localhost:8000/sse").unwrap();
        let url = resolve_endpoint(&base, "/messages?session_id=abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/messages?session_id=abc");
    }

    #[test]
    fn test_resolve_rejects_foreign_origin() {
        let base = Url::parse("http://localhost:8000/sse").unwrap();
        assert!(resolve_endpoint(&base, "http://evil.example/messages").is_err());
    }

    #[tokio::test]
    async fn test_connect_reads_endpoint_then_messages() {
        let body = concat!(
            "event: endpoint\n",
            "data: /messages?session_id=1\n\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n",
        );
        let server = test_http::serve_once(test_http::event_stream_response(body)).await;

        let transport = connect(&server.url("/sse")).await.unwrap();
        assert_eq!(transport.endpoint().path(), "/messages");

        match transport.receive().await.unwrap() {
            Some(JsonRpcMessage::Response(resp)) => assert!(resp.result.is_some()),
            other => panic!("expected response, got {other:?}"),
        }

        // server closed the stream
        assert!(transport.receive().await.unwrap().is_none());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_connect_fails_without_endpoint() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n\n";
        let server = test_http::serve_once(test_http::event_stream_response(body)).await;

        let err = connect(&server.url("/sse")).await.err().unwrap();
        assert!(matches!(err, McpError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = SseTransport::connect(
            "down",
            reqwest::Client::new(),
            &test_http::unused_url(),
            &HashMap::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, McpError::ConnectFailed { ref server, .. } if server == "down"));
    }
}
