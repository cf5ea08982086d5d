use std::sync::Arc;

use async_trait::async_trait;

use agent_events::AgentEvent;

use crate::capabilities::Capabilities;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::options::ExecuteOptions;
use crate::result::ExecuteResult;

pub type EventHandler = Arc<dyn Fn(AgentEvent) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The uniform surface every backend adapter presents to the registry and to
/// callers. Each backend crate provides exactly one implementation; nothing
/// outside `agent_core` and the adapter crates needs to know which CLI is
/// actually running.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn config(&self) -> &AgentConfig;

    /// Cheap liveness probe (e.g. `--version`), independent of `execute`.
    async fn ping(&self) -> Result<(), AgentError>;

    async fn execute(&self, options: ExecuteOptions) -> Result<ExecuteResult, AgentError>;

    /// Installs a handler invoked for every aggregated event this agent
    /// produces. A default no-op keeps the trait usable for backends that
    /// never stream.
    fn set_event_handler(&self, _handler: Option<EventHandler>) {}

    /// Installs a sink for free-form diagnostic lines (e.g. raw stderr not
    /// otherwise classified).
    fn set_log_callback(&self, _callback: Option<LogCallback>) {}

    /// Attaches optional crash-dump/safe-executor hooks. Default is a
    /// no-op since only backends that opt in need it.
    fn with_diagnostics(self: Arc<Self>, _diagnostics: Arc<dyn Diagnostics>) -> Arc<Self>
    where
        Self: Sized,
    {
        self
    }
}

/// Trait-object injection points for host-specific observability that the
/// orchestrator itself has no opinion about.
pub trait Diagnostics: Send + Sync {
    fn safe_executor(&self) -> Option<Arc<dyn SafeExecutor>> {
        None
    }

    fn crash_dump_writer(&self) -> Option<Arc<dyn CrashDumpWriter>> {
        None
    }
}

/// Runs arbitrary host-provided recovery logic before an adapter gives up on
/// a backend (e.g. clearing a stale lockfile). Consulted by
/// `execute_with_diagnostics`/`execute_command_with_diagnostics` after the
/// first failed attempt; a `true` return gets the command retried once.
pub trait SafeExecutor: Send + Sync {
    fn try_recover(&self, agent: &str, error: &AgentError) -> bool;
}

/// Persists a crash artifact (stdout/stderr/exit status) for post-mortem
/// debugging when a backend exits abnormally.
pub trait CrashDumpWriter: Send + Sync {
    fn write_crash_dump(&self, agent: &str, stdout: &[u8], stderr: &[u8]);
}
