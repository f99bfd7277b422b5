//! Stdio transport: one child process per server.
//!
//! Messages are newline-delimited JSON on the child's stdin/stdout. The child's
//! stderr is forwarded to tracing and the last few lines are kept for
//! diagnostics when the process exits unexpectedly.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::Transport;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{JsonRpcMessage, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Grace period after closing stdin before the child is force-killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of stderr lines retained for exit diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// JSON-RPC transport over a child process's stdin/stdout.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the server process with piped stdio.
    pub fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::ConnectFailed {
            server: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let server = server_name.to_string();
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                // Drain until EOF; dropping the pipe early would kill the child on its next write.
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = decode_line(&buf);
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(server = %server, "stderr: {line}");
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        tracing::info!(server = server_name, command, pid = ?child.id(), "spawned server process");

        Ok(Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(Some(child)),
            stderr_tail,
            closed: AtomicBool::new(false),
        })
    }

    /// Recent stderr output, oldest line first.
    pub fn stderr_tail(&self) -> Vec<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_name.clone(),
        }
    }

    /// Invalidate after an I/O failure and release the process.
    async fn fail(&self, reason: String) -> McpError {
        tracing::warn!(server = %self.server_name, reason = %reason, "stdio transport failed");
        if let Err(e) = self.release().await {
            tracing::warn!(
                server = %self.server_name,
                error = %e,
                "release after failure did not complete cleanly"
            );
        }
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    /// Close stdin, wait for the child to exit, kill it if it doesn't.
    /// Only the first caller does any work.
    async fn release(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A writer blocked on a full pipe holds the lock; the kill below unblocks it.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "server process exited");
                Ok(())
            }
            _ => {
                tracing::debug!(server = %self.server_name, "server process did not exit, killing");
                child.kill().await.map_err(|e| McpError::ShutdownFailed {
                    server: self.server_name.clone(),
                    reason: format!("kill failed: {e}"),
                })
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut line = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        line.push('\n');

        let written = {
            let mut guard = self.writer.lock().await;
            let Some(stdin) = guard.as_mut() else {
                return Err(self.closed_error());
            };
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };

        match written {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(format!("write to stdin failed: {e}")).await),
        }
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let bytes = match reader.read_until(b'\n', &mut buf).await {
                Ok(n) => n,
                Err(e) => return Err(self.fail(format!("read from stdout failed: {e}")).await),
            };

            if bytes == 0 {
                let tail = self.stderr_tail();
                tracing::warn!(
                    server = %self.server_name,
                    stderr = %tail.join("\n"),
                    "server closed stdout"
                );
                if let Err(e) = self.release().await {
                    tracing::warn!(
                        server = %self.server_name,
                        error = %e,
                        "release after EOF did not complete cleanly"
                    );
                }
                return Ok(None);
            }

            let line = decode_line(&buf);
            if line.is_empty() {
                continue;
            }

            // Servers sometimes print banners or logs to stdout, not always UTF-8.
            match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(_) => {
                    tracing::debug!(
                        server = %self.server_name,
                        line = %line,
                        "skipping non-JSON-RPC stdout line"
                    );
                }
            }
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.release().await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Decode one raw line, replacing invalid UTF-8, without the line terminator.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
