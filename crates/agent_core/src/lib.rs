#![forbid(unsafe_code)]
//! Shared data model, base subprocess executor, error taxonomy, and backend
//! registry for the agent orchestrator. This is the sole place that spawns
//! backend subprocesses; adapter crates in turn depend only on this
//! crate and on `agent_events`, never on `tokio::process` directly.

mod agent_trait;
mod ansi;
mod capabilities;
mod classify;
mod config;
mod error;
mod executor;
mod log_tail;
mod options;
mod outcome;
mod process;
mod registry;
mod result;
mod stream_method;
mod tokens;

pub use agent_trait::{Agent, CrashDumpWriter, Diagnostics, EventHandler, LogCallback, SafeExecutor};
pub use ansi::{strip_ansi, strip_copilot_stats};
pub use capabilities::Capabilities;
pub use classify::{classify_stderr, classify_stderr_line, extract_structured_error, StderrErrorKind};
pub use config::AgentConfig;
pub use error::AgentError;
pub use executor::{
    execute_command_with_diagnostics, execute_with_diagnostics, BaseExecutor, CaptureBuffers, ExecuteRequest,
    ParserFactory, StreamingRequest,
};
pub use log_tail::LogTailer;
pub use options::{ConversationMessage, ExecuteOptions, MessageRole, OutputFormat};
pub use outcome::classify_exit;
pub use process::{spawn_with_retry, ProcessGuard};
pub use registry::{AgentFactory, Registry};
pub use result::{CommandResult, ExecuteResult, MAX_TOKEN_VALUE};
pub use stream_method::{StreamConfig, StreamMethod};
pub use tokens::{estimate_cost, extract_and_validate_tokens, TokenExtraction};

pub use agent_events::{
    normalize_effort_for_claude, resolve_effort, AgentEvent, AgentEventKind, EventAggregator,
    JsonLineStreamParser, StreamFinish, StreamParser,
};
