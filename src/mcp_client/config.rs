//! Server list loading.
//!
//! The server list is a JSON file with an ordered `servers` array. Order is
//! significant: it is the acquisition order at startup and, reversed, the
//! teardown order.

use std::collections::HashSet;
use std::path::Path;

use crate::config::expand_tilde;

use super::errors::McpError;
use super::types::{McpServersConfig, TransportConfig};

/// Default file name of the server list.
pub const DEFAULT_SERVERS_FILE: &str = "server_config.json";

/// Load and validate a server list.
///
/// `~` in stdio `command` and `cwd` is expanded; a relative `cwd` is taken
/// relative to the directory holding the file.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("cannot read server list {}: {e}", path.display()),
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let config = parse_servers_config(&content, base_dir).map_err(|e| match e {
        McpError::ConfigError { reason } => McpError::ConfigError {
            reason: format!("{}: {reason}", path.display()),
        },
        other => other,
    })?;

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "loaded server list"
    );
    Ok(config)
}

/// Parse a server list from JSON text, resolving paths against `base_dir`.
pub fn parse_servers_config(content: &str, base_dir: &Path) -> Result<McpServersConfig, McpError> {
    let mut config: McpServersConfig =
        serde_json::from_str(content).map_err(|e| McpError::ConfigError {
            reason: format!("invalid server list: {e}"),
        })?;

    validate(&config)?;

    for server in &mut config.servers {
        if let TransportConfig::Stdio { command, cwd, .. } = &mut server.transport {
            *command = expand_tilde(command);
            if let Some(dir) = cwd.as_mut() {
                let expanded = expand_tilde(dir);
                *dir = if Path::new(&expanded).is_relative() {
                    base_dir.join(&expanded).to_string_lossy().into_owned()
                } else {
                    expanded
                };
            }
        }
    }

    Ok(config)
}

fn validate(config: &McpServersConfig) -> Result<(), McpError> {
    let mut seen = HashSet::new();
    for server in &config.servers {
        if server.name.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: "server name must not be empty".into(),
            });
        }
        if !seen.insert(server.name.as_str()) {
            return Err(McpError::DuplicateServer {
                name: server.name.clone(),
            });
        }

        let target = match &server.transport {
            TransportConfig::Stdio { command, .. } => command,
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => url,
        };
        if target.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{}' has an empty {} target", server.name, server.kind()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::mcp_client::types::TransportKind;

    #[test]
    fn test_parse_all_transports_in_order() {
        let json = r#"{
            "servers": [
                {"name": "fs", "transport": "stdio", "command": "uvx",
                 "args": ["mcp-server-filesystem", "."], "env": {"DEBUG": "1"}, "required": true},
                {"name": "fetch", "transport": "subprocess", "command": "uvx",
                 "args": ["mcp-server-fetch"]},
                {"name": "legacy", "transport": "sse", "url": "http://localhost:8000/sse"},
                {"name": "remote", "transport": "streamable-http",
                 "url": "https://mcp.example.com/mcp",
                 "headers": {"Authorization": "Bearer abc"}}
            ]
        }"#;
        let config = parse_servers_config(json, Path::new("/srv")).unwrap();

        let names: Vec<&str> = config.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fs", "fetch", "legacy", "remote"]);
        assert!(config.servers[0].required);
        assert!(!config.servers[1].required);
        assert_eq!(config.servers[1].kind(), TransportKind::Stdio);
        assert_eq!(config.servers[2].kind(), TransportKind::Sse);
        match &config.servers[3].transport {
            TransportConfig::StreamableHttp { headers, .. } => {
                assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
            }
            other => panic!("expected streamable http, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{"servers": [
            {"name": "a", "transport": "stdio", "command": "x"},
            {"name": "a", "transport": "sse", "url": "http://h/sse"}
        ]}"#;
        assert!(matches!(
            parse_servers_config(json, Path::new(".")),
            Err(McpError::DuplicateServer { name }) if name == "a"
        ));
    }

    #[test]
    fn test_empty_target_rejected() {
        let json = r#"{"servers": [{"name": "a", "transport": "sse", "url": " "}]}"#;
        assert!(matches!(
            parse_servers_config(json, Path::new(".")),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let json = r#"{"servers": [{"name": "a", "transport": "carrier-pigeon"}]}"#;
        assert!(matches!(
            parse_servers_config(json, Path::new(".")),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_relative_cwd_resolved_against_file_dir() {
        let json = r#"{"servers": [
            {"name": "a", "transport": "stdio", "command": "x", "cwd": "servers/a"}
        ]}"#;
        let config = parse_servers_config(json, Path::new("/etc/chatbot")).unwrap();
        match &config.servers[0].transport {
            TransportConfig::Stdio { cwd, .. } => {
                assert_eq!(
                    cwd.as_deref().map(Path::new),
                    Some(Path::new("/etc/chatbot/servers/a"))
                );
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"servers": [{{"name": "a", "transport": "stdio", "command": "cat"}}]}}"#
        )
        .unwrap();
        let config = load_servers_config(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);

        let missing = load_servers_config(Path::new("/nonexistent/server_config.json"));
        assert!(matches!(missing, Err(McpError::ConfigError { .. })));
    }
}
