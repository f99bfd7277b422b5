//! Streamable HTTP transport.
//!
//! Every client message is a POST to the server URL. The server answers with:
//! - `202 Accepted` and no body, for notifications and responses
//! - `application/json`, a single message or a batch
//! - `text/event-stream`, one or more `message` events
//!
//! A session ID handed out in the `Mcp-Session-Id` header is echoed on every
//! later request and released with a DELETE on close.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::event_stream::pump_events;
use super::{build_headers, Transport};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{JsonRpcMessage, TransportKind};

/// Header carrying the server-assigned session ID.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Upper bound on the best-effort session DELETE during close.
const DELETE_TIMEOUT: Duration = Duration::from_secs(2);

type Inbound = Result<JsonRpcMessage, McpError>;

/// JSON-RPC transport over POST requests to a single URL.
pub struct StreamableHttpTransport {
    server_name: String,
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: StdMutex<Option<String>>,
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StreamableHttpTransport {
    /// Prepare the transport. No request is made until the first `send`.
    pub fn connect(
        server_name: &str,
        http: reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let url = Url::parse(url).map_err(|e| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;
        let headers = build_headers(server_name, headers)?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            url,
            headers,
            session_id: StdMutex::new(None),
            inbound_tx: StdMutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Session ID assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn inbound_sender(&self) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_name.clone(),
        }
    }

    /// Mark closed, stop response readers, drop the inbound sender.
    /// Returns false if already released.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        true
    }

    fn fail(&self, reason: String) -> McpError {
        tracing::warn!(
            server = %self.server_name,
            reason = %reason,
            "streamable http transport failed"
        );
        self.release();
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    /// Queue messages from a JSON response body.
    fn accept_json_body(&self, body: &str) -> Result<(), McpError> {
        if body.trim().is_empty() {
            return Ok(());
        }
        let messages = JsonRpcMessage::parse_batch(body)
            .map_err(|e| self.fail(format!("malformed JSON response body: {e}")))?;
        let Some(tx) = self.inbound_sender() else {
            return Err(self.closed_error());
        };
        for message in messages {
            let _ = tx.send(Ok(message));
        }
        Ok(())
    }

    /// Forward `message` events from an SSE response body in the background.
    fn accept_event_stream(&self, response: reqwest::Response) -> Result<(), McpError> {
        let Some(tx) = self.inbound_sender() else {
            return Err(self.closed_error());
        };
        let server = self.server_name.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let events_tx = tx.clone();
            let events_server = server.clone();
            let on_event = move |event: super::event_stream::SseEvent| {
                if event.event != "message" {
                    return ControlFlow::Continue(());
                }
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
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
        });
        Ok(())
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let session_id = self.session_id();
        let mut request = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(id) = &session_id {
            request = request.header(SESSION_HEADER, id.as_str());
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.closed_error()),
            response = request.send() => response,
        };
        let response = response.map_err(|e| self.fail(format!("POST failed: {e}")))?;

        if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut current = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_deref() != Some(id) {
                tracing::debug!(
                    server = %self.server_name,
                    session_id = id,
                    "server assigned session"
                );
                *current = Some(id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && session_id.is_some() {
            return Err(self.fail("server no longer recognises the session".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.fail(format!("POST returned HTTP {status}: {body}")));
        }
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            self.accept_event_stream(response)
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| self.fail(format!("failed to read response body: {e}")))?;
            self.accept_json_body(&body)
        }
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let next = self.inbound_rx.lock().await.recv().await;
        match next {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.release();
                Err(e)
            }
            None => {
                self.release();
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        if !self.release() {
            return Ok(());
        }

        if let Some(id) = self.session_id() {
            let delete = self
                .http
                .delete(self.url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, id.as_str())
                .send();
            match tokio::time::timeout(DELETE_TIMEOUT, delete).await {
                Ok(Ok(response)) => {
                    tracing::debug!(
                        server = %self.server_name,
                        status = %response.status(),
                        "session deleted"
                    );
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        server = %self.server_name,
                        error = %e,
                        "session delete failed"
                    );
                }
                Err(_) => {
                    tracing::debug!(server = %self.server_name, "session delete timed out");
                }
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
