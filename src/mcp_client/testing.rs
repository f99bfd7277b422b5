//! In-memory MCP servers for tests.
//!
//! `MockServer` scripts a server's behaviour, `MockTransport` plays it back,
//! and `MockConnector` hands out transports by descriptor name. Everything
//! observable (live handles, calls, close order) lands in a shared `MockLog`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use super::errors::McpError;
use super::transport::{Connector, Transport};
use super::types::{
    error_codes, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, ServerDescriptor,
    TransportKind, LATEST_PROTOCOL_VERSION,
};

const PING_ID: &str = "server-ping";

// ─── MockLog ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MockLog {
    live: AtomicUsize,
    opened: AtomicUsize,
    sent: StdMutex<Vec<(String, String)>>,
    calls: StdMutex<Vec<(String, String)>>,
    closes: StdMutex<Vec<(String, Instant)>>,
    pings: StdMutex<HashSet<String>>,
    disconnected: StdMutex<HashSet<String>>,
}

impl MockLog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transports opened and not yet released.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Transports ever opened.
    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Methods sent to a server, in order.
    pub(crate) fn sent_methods(&self, server: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == server)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// `(server, tool)` for every `tools/call` received.
    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Servers in the order their transports were released.
    pub(crate) fn close_order(&self) -> Vec<String> {
        self.closes.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    pub(crate) fn close_times(&self) -> Vec<Instant> {
        self.closes.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub(crate) fn ping_answered(&self, server: &str) -> bool {
        self.pings.lock().unwrap().contains(server)
    }

    /// Make every later send to this server fail like a broken pipe.
    pub(crate) fn disconnect(&self, server: &str) {
        self.disconnected.lock().unwrap().insert(server.to_string());
    }

    fn is_disconnected(&self, server: &str) -> bool {
        self.disconnected.lock().unwrap().contains(server)
    }
}

// ─── MockServer ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct MockServer {
    name: String,
    protocol_version: String,
    tools: Vec<(String, Value)>,
    resources: Vec<String>,
    prompts: Vec<String>,
    replies: HashMap<String, String>,
    failing_tools: HashSet<String>,
    page_size: usize,
    fail_initialize: bool,
    hang_on_call: bool,
    ping_before_reply: bool,
    call_delay: Option<Duration>,
}

impl MockServer {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            replies: HashMap::new(),
            failing_tools: HashSet::new(),
            page_size: usize::MAX,
            fail_initialize: false,
            hang_on_call: false,
            ping_before_reply: false,
            call_delay: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn with_tools(mut self, names: &[&str]) -> Self {
        for name in names {
            self.tools
                .push((name.to_string(), json!({"type": "object", "properties": {}})));
        }
        self
    }

    pub(crate) fn with_tool_schema(mut self, name: &str, schema: Value) -> Self {
        self.tools.push((name.to_string(), schema));
        self
    }

    pub(crate) fn with_tool_reply(mut self, tool: &str, text: &str) -> Self {
        self.replies.insert(tool.to_string(), text.to_string());
        self
    }

    pub(crate) fn with_failing_tool(mut self, tool: &str) -> Self {
        self.failing_tools.insert(tool.to_string());
        self
    }

    pub(crate) fn with_resource(mut self, uri: &str) -> Self {
        self.resources.push(uri.to_string());
        self
    }

    pub(crate) fn with_prompt(mut self, name: &str) -> Self {
        self.prompts.push(name.to_string());
        self
    }

    pub(crate) fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub(crate) fn with_protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = version.to_string();
        self
    }

    pub(crate) fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub(crate) fn hanging_on_call(mut self) -> Self {
        self.hang_on_call = true;
        self
    }

    /// Hold every `tools/call` reply back for `delay`.
    pub(crate) fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub(crate) fn pinging_before_reply(mut self) -> Self {
        self.ping_before_reply = true;
        self
    }

    /// Descriptor a `MockConnector` resolves back to this server.
    pub(crate) fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor::stdio(&self.name, "mock-server", &[])
    }

    fn page<T: Clone>(&self, items: &[T], params: &Value) -> (Vec<T>, Option<String>) {
        let start = params["cursor"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let end = start.saturating_add(self.page_size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        (items[start.min(end)..end].to_vec(), next)
    }

    fn respond(&self, request: &JsonRpcRequest, log: &MockLog) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let params = request.params.clone().unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "initialize" => {
                if self.fail_initialize {
                    return Some(JsonRpcResponse::failure(
                        id,
                        error_codes::INTERNAL_ERROR,
                        "initialization exploded",
                    ));
                }
                let mut caps = serde_json::Map::new();
                if !self.tools.is_empty() {
                    caps.insert("tools".into(), json!({}));
                }
                if !self.resources.is_empty() {
                    caps.insert("resources".into(), json!({}));
                }
                if !self.prompts.is_empty() {
                    caps.insert("prompts".into(), json!({}));
                }
                json!({
                    "protocolVersion": self.protocol_version,
                    "capabilities": caps,
                    "serverInfo": {"name": self.name, "version": "0.0.1"},
                })
            }
            "tools/list" => {
                let (page, next) = self.page(&self.tools, &params);
                let tools: Vec<Value> = page
                    .iter()
                    .map(|(name, schema)| {
                        json!({
                            "name": name,
                            "description": format!("{name} tool"),
                            "inputSchema": schema,
                        })
                    })
                    .collect();
                json!({"tools": tools, "nextCursor": next})
            }
            "resources/list" => {
                let (page, next) = self.page(&self.resources, &params);
                let resources: Vec<Value> = page
                    .iter()
                    .map(|uri| json!({"uri": uri, "name": uri, "mimeType": "text/plain"}))
                    .collect();
                json!({"resources": resources, "nextCursor": next})
            }
            "prompts/list" => {
                let (page, next) = self.page(&self.prompts, &params);
                let prompts: Vec<Value> = page
                    .iter()
                    .map(|name| {
                        json!({"name": name, "arguments": [{"name": "topic", "required": true}]})
                    })
                    .collect();
                json!({"prompts": prompts, "nextCursor": next})
            }
            "tools/call" => {
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                log.calls.lock().unwrap().push((self.name.clone(), tool.clone()));
                if self.hang_on_call {
                    return None;
                }
                if self.failing_tools.contains(&tool) {
                    json!({
                        "content": [{"type": "text", "text": format!("{tool} failed")}],
                        "isError": true,
                    })
                } else {
                    let text = self
                        .replies
                        .get(&tool)
                        .cloned()
                        .unwrap_or_else(|| format!("{}:{} done", self.name, tool));
                    json!({"content": [{"type": "text", "text": text}]})
                }
            }
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                let text = format!("contents of {uri}");
                json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": text}]})
            }
            "prompts/get" => {
                let name = params["name"].as_str().unwrap_or_default();
                let topic = params["arguments"]["topic"].as_str().unwrap_or("nothing");
                json!({
                    "description": format!("{name} prompt"),
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": format!("{name} about {topic}")},
                    }],
                })
            }
            other => {
                return Some(JsonRpcResponse::failure(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    &format!("unknown method {other}"),
                ));
            }
        };

        Some(JsonRpcResponse::success(id, result))
    }
}

// ─── MockTransport ───────────────────────────────────────────────────────────

pub(crate) struct MockTransport {
    server: MockServer,
    log: Arc<MockLog>,
    outbox_tx: StdMutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    outbox_rx: Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new(server: MockServer, log: Arc<MockLog>) -> Self {
        log.live.fetch_add(1, Ordering::SeqCst);
        log.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            server,
            log,
            outbox_tx: StdMutex::new(Some(tx)),
            outbox_rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.log
            .closes
            .lock()
            .unwrap()
            .push((self.server.name.clone(), Instant::now()));
        self.log.live.fetch_sub(1, Ordering::SeqCst);
        self.outbox_tx.lock().unwrap().take();
    }

    fn push(&self, message: JsonRpcMessage) {
        if let Some(tx) = self.outbox_tx.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn server_name(&self) -> &str {
        &self.server.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::TransportClosed {
                server: self.server.name.clone(),
            });
        }
        if self.log.is_disconnected(&self.server.name) {
            self.release();
            return Err(McpError::TransportError {
                server: self.server.name.clone(),
                reason: "broken pipe".into(),
            });
        }

        let label = message.method().unwrap_or("response").to_string();
        self.log.sent.lock().unwrap().push((self.server.name.clone(), label));

        match message {
            JsonRpcMessage::Request(request) => {
                if let Some(reply) = self.server.respond(request, &self.log) {
                    let is_call = request.method == "tools/call";
                    if let (Some(delay), true) = (self.server.call_delay, is_call) {
                        tokio::time::sleep(delay).await;
                    }
                    if self.server.ping_before_reply && request.method == "tools/call" {
                        let ping = JsonRpcRequest {
                            jsonrpc: "2.0".into(),
                            id: RequestId::String(PING_ID.into()),
                            method: "ping".into(),
                            params: None,
                        };
                        self.push(ping.into());
                    }
                    self.push(reply.into());
                }
            }
            JsonRpcMessage::Response(response) => {
                let is_ping = response.id == Some(RequestId::String(PING_ID.into()));
                if is_ping && response.result.is_some() {
                    self.log.pings.lock().unwrap().insert(self.server.name.clone());
                }
            }
            JsonRpcMessage::Notification(_) => {}
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpError> {
        if self.is_closed() {
            return Err(McpError::TransportClosed {
                server: self.server.name.clone(),
            });
        }
        Ok(self.outbox_rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.release();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── MockConnector ───────────────────────────────────────────────────────────

/// Opens `MockTransport`s by descriptor name; refused names fail to connect.
pub(crate) struct MockConnector {
    servers: HashMap<String, MockServer>,
    refused: HashSet<String>,
    log: Arc<MockLog>,
}

impl MockConnector {
    pub(crate) fn new(log: &Arc<MockLog>) -> Self {
        Self {
            servers: HashMap::new(),
            refused: HashSet::new(),
            log: Arc::clone(log),
        }
    }

    pub(crate) fn with_server(mut self, server: MockServer) -> Self {
        self.servers.insert(server.name.clone(), server);
        self
    }

    pub(crate) fn refusing(mut self, name: &str) -> Self {
        self.refused.insert(name.to_string());
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Transport>, McpError> {
        let name = descriptor.name.as_str();
        if self.refused.contains(name) {
            return Err(McpError::ConnectFailed {
                server: name.to_string(),
                reason: "connection refused".into(),
            });
        }
        match self.servers.get(name) {
            Some(server) => Ok(Box::new(MockTransport::new(server.clone(), Arc::clone(&self.log)))),
            None => Err(McpError::ConnectFailed {
                server: name.to_string(),
                reason: "no such server".into(),
            }),
        }
    }
}
