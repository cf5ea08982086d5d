use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The taxonomy surfaced to callers. Kinds are behavioural categories,
/// not wrappers around a specific backend's wording.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("executable `{path}` not found or failed to respond to a liveness probe")]
    NotFound { path: String },

    #[error("{agent} exceeded timeout of {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("{agent} execution was cancelled")]
    Cancelled { agent: String },

    #[error("{agent} reported a rate limit or quota error: {detail}")]
    RateLimit { agent: String, detail: String },

    #[error("{agent} reported an authentication/authorization failure: {detail}")]
    Auth { agent: String, detail: String },

    #[error("{agent} reported a network failure: {detail}")]
    Network { agent: String, detail: String },

    #[error("{agent} exceeded its context or output length: {detail}")]
    OutputTooLong { agent: String, detail: String },

    #[error("{agent} streaming payload did not conform to the expected envelope: {detail}")]
    Parse { agent: String, detail: String },

    #[error("{agent} exited with a non-classifiable failure: {detail}")]
    ExecutionFailed { agent: String, detail: String },

    #[error("failed to spawn `{binary}`: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while driving a child process: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to join a pump task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AgentError {
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            AgentError::Timeout { agent, .. }
            | AgentError::Cancelled { agent }
            | AgentError::RateLimit { agent, .. }
            | AgentError::Auth { agent, .. }
            | AgentError::Network { agent, .. }
            | AgentError::OutputTooLong { agent, .. }
            | AgentError::Parse { agent, .. }
            | AgentError::ExecutionFailed { agent, .. } => Some(agent),
            _ => None,
        }
    }
}
