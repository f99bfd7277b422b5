//! Agent Core — the decision loop that turns user queries into tool calls.
//!
//! Submodules:
//! - `query_loop`: Model ↔ tools state machine for one query
//! - `tool_router`: Fan-out / fan-in dispatch of one round of tool calls
//! - `conversation`: In-memory chat history
//! - `types`: Invocations, outcomes, and the `agent` config section
//! - `errors`: Errors that end a query

pub mod conversation;
pub mod errors;
pub mod query_loop;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use conversation::Conversation;
pub use errors::AgentError;
pub use query_loop::QueryLoop;
pub use tool_router::ToolRouter;
pub use types::{
    AgentConfig, InvocationOutcome, InvocationStatus, PendingInvocation, QueryOutcome, ToolRound,
};
