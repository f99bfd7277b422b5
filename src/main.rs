//! `mcp-chatbot` — interactive chat over every configured MCP server.
//!
//! Usage: `mcp-chatbot [CONFIG]`

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use mcp_chatbot::agent_core::QueryLoop;
use mcp_chatbot::chat::{ChatShell, ShellReply};
use mcp_chatbot::config::resolve_app_config;
use mcp_chatbot::inference::InferenceClient;
use mcp_chatbot::mcp_client::{load_servers_config, McpClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match mcp_chatbot::init_tracing() {
        Ok(path) => eprintln!("logging to {}", path.display()),
        Err(e) => eprintln!("warning: file logging disabled: {e}"),
    }

    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let (config, _) =
        resolve_app_config(explicit.as_deref()).context("failed to load configuration")?;

    let servers = load_servers_config(&config.servers_file).context("failed to load server list")?;
    let model = InferenceClient::new(config.model.clone())
        .context("failed to set up the model client")?;

    let mut client = McpClient::new(config.session);
    let report = client
        .connect_all(&servers.servers, config.startup.failure_policy)
        .await
        .context("startup aborted")?;
    for (name, error) in &report.failed {
        eprintln!("warning: server '{name}' unavailable: {error}");
    }

    tracing::info!(model = %model.model_name(), "chat session starting");
    let query_loop = QueryLoop::new(Arc::new(model), config.agent.clone());
    let mut shell = ChatShell::new(client, query_loop);
    println!("{}", shell.banner());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nQuery: ");
        std::io::stdout().flush().context("failed to write prompt")?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let reply = tokio::select! {
            reply = shell.handle_line(&line) => reply,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        match reply {
            ShellReply::Output(text) => println!("\n{text}"),
            ShellReply::Silent => {}
            ShellReply::Quit => break,
        }
    }

    let report = shell.shutdown().await;
    for failure in report.failures() {
        if let Some(error) = &failure.error {
            eprintln!("warning: closing '{}' failed: {error}", failure.name);
        }
    }
    tracing::info!(closed = ?report.order(), clean = report.is_clean(), "chat session ended");
    Ok(())
}
