//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that end a query.
///
/// Capability failures are not here: they become `InvocationOutcome`s the
/// model sees and reacts to.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The decision model could not produce a turn.
    #[error("model error: {0}")]
    Model(#[from] InferenceError),

    /// The model kept asking for tools past the round limit.
    #[error("query did not finish within {limit} model turns")]
    IterationLimit { limit: usize },

    /// The whole query ran past its deadline.
    #[error("query timed out after {secs}s")]
    QueryTimeout { secs: u64 },
}
