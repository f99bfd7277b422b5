//! Application configuration.
//!
//! The app config is a YAML file (`mcp-chatbot.yaml`) with one section per
//! layer. String values may use `${VAR}` or `${VAR:-default}` to pull from
//! the environment. Every section is optional; a missing file means defaults.
//!
//! Lookup order:
//! 1. The path given on the command line
//! 2. `MCP_CHATBOT_CONFIG`
//! 3. `mcp-chatbot.yaml` in the working directory or any parent

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::AgentConfig;
use crate::inference::ModelConfig;
use crate::mcp_client::config::DEFAULT_SERVERS_FILE;
use crate::mcp_client::{SessionOptions, StartupPolicy};

// ─── Constants ───────────────────────────────────────────────────────────────

/// File name searched for when no path is given.
pub const CONFIG_FILE_NAME: &str = "mcp-chatbot.yaml";

/// Environment variable naming the config file explicitly.
pub const CONFIG_ENV_VAR: &str = "MCP_CHATBOT_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors loading the app config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named config file does not exist.
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Parsed, but a value is unusable.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── AppConfig ───────────────────────────────────────────────────────────────

/// The `startup` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub failure_policy: StartupPolicy,
}

/// Everything the chat binary needs to start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub agent: AgentConfig,
    pub session: SessionOptions,
    pub startup: StartupConfig,
    /// Server list location. Relative paths are relative to the config file.
    pub servers_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            agent: AgentConfig::default(),
            session: SessionOptions::default(),
            startup: StartupConfig::default(),
            servers_file: PathBuf::from(DEFAULT_SERVERS_FILE),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate().map_err(|e| ConfigError::Invalid { reason: e.to_string() })?;
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent.max_iterations must be at least 1".into(),
            });
        }
        if self.session.request_timeout_ms == 0 || self.session.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "session timeouts must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Find the config file: `MCP_CHATBOT_CONFIG` first, then walk upward from `start`.
///
/// `Ok(None)` means no file anywhere, which is not an error.
pub fn find_config_path(start: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(expand_tilde(&explicit));
        if !path.exists() {
            return Err(ConfigError::NotFound { path });
        }
        return Ok(Some(path));
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            return Ok(None);
        }
    }
}

/// Load and validate one config file.
pub fn load_app_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound { path: path.to_path_buf() }
        } else {
            ConfigError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    })?;

    let interpolated = interpolate_env_vars(&raw);
    let mut config: AppConfig = if interpolated.trim().is_empty() {
        AppConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    let servers_file = PathBuf::from(expand_tilde(&config.servers_file.to_string_lossy()));
    config.servers_file = match path.parent() {
        Some(dir) if servers_file.is_relative() => dir.join(servers_file),
        _ => servers_file,
    };

    config.validate()?;
    Ok(config)
}

/// Resolve and load the config for this run.
///
/// Returns the config and the file it came from, if any.
pub fn resolve_app_config(
    explicit: Option<&Path>,
) -> Result<(AppConfig, Option<PathBuf>), ConfigError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().map_err(|e| ConfigError::Invalid {
                reason: format!("cannot determine working directory: {e}"),
            })?;
            find_config_path(&cwd)?
        }
    };

    match path {
        Some(path) => {
            let config = load_app_config(&path)?;
            tracing::info!(path = %path.display(), "loaded app config");
            Ok((config, Some(path)))
        }
        None => {
            tracing::info!("no app config found, using defaults");
            Ok((AppConfig::default(), None))
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset without a default is empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
