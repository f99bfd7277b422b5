//! MCP Client — connections to many MCP servers behind one namespace.
//!
//! This module handles:
//! - Transports: subprocess stdio, legacy SSE, and streamable HTTP
//! - Sessions: handshake, discovery, request/response correlation
//! - The connection registry: ordered startup, reverse-order teardown
//! - The capability table: tools, resources, and prompts routed by name
//! - Loading the server list
//!
//! The `McpClient` facade is what the query loop and chat shell use.

pub mod capabilities;
pub mod client;
pub mod config;
pub mod errors;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use capabilities::{CapabilityAggregator, CapabilityEntry, CapabilityTable, CollisionDiagnostic};
pub use client::McpClient;
pub use config::load_servers_config;
pub use errors::{ErrorCategory, McpError};
pub use registry::{ConnectionRegistry, ShutdownReport, StartupPolicy, StartupReport};
pub use session::{Session, SessionOptions, SessionState};
pub use types::{CapabilityKind, McpServersConfig, ServerDescriptor, TransportConfig, TransportKind};
