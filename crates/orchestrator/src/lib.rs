#![forbid(unsafe_code)]
//! Facade crate: wires the five backend adapter factories into a single
//! `Registry` and re-exports the public surface a consumer needs to drive
//! the orchestrator without reaching into each adapter crate individually.
//!
//! No CLI binary lives here — a CLI front-end, application configuration
//! loading, and workflow/phase logic that *uses* this orchestrator are all
//! left to external collaborators.

use std::sync::Arc;

use agent_core::{AgentFactory, BaseExecutor, Registry};

/// Builds a `Registry` with all five built-in backend factories registered
/// against a freshly constructed, shared `BaseExecutor`.
/// Each backend's default config (executable path equal to its name, empty
/// model, 5-minute total timeout) comes from `Registry::new` itself; this
/// function only supplies the factories.
pub async fn build_registry() -> Registry {
    let executor = Arc::new(BaseExecutor::new());
    build_registry_with_executor(executor).await
}

/// Same as [`build_registry`], but lets a caller share one `BaseExecutor`
/// across a registry it builds itself (e.g. to inject diagnostics hooks
/// before any agent is constructed).
pub async fn build_registry_with_executor(executor: Arc<BaseExecutor>) -> Registry {
    let registry = Registry::new();
    register_builtins(&registry, executor).await;
    registry
}

/// Registers factories for `claude`, `gemini`, `codex`, `copilot`, and
/// `opencode` on an existing registry. Split out from [`build_registry`] so
/// a caller that already owns a `Registry` (e.g. one preloaded with custom
/// configs) can still wire in the built-in backends.
pub async fn register_builtins(registry: &Registry, executor: Arc<BaseExecutor>) {
    let factories: [(&str, AgentFactory); 5] = [
        ("claude", agent_claude::factory(Arc::clone(&executor))),
        ("gemini", agent_gemini::factory(Arc::clone(&executor))),
        ("codex", agent_codex::factory(Arc::clone(&executor))),
        ("copilot", agent_copilot::factory(Arc::clone(&executor))),
        ("opencode", agent_opencode::factory(Arc::clone(&executor))),
    ];
    for (name, factory) in factories {
        registry.register_factory(name, factory).await;
    }
}

pub use agent_core::{
    classify_exit, estimate_cost, extract_and_validate_tokens, strip_ansi, strip_copilot_stats,
    Agent, AgentConfig, AgentError, Capabilities, CommandResult, ConversationMessage, Diagnostics,
    EventHandler, ExecuteOptions, ExecuteResult, LogCallback, MessageRole, OutputFormat,
    TokenExtraction, MAX_TOKEN_VALUE,
};
pub use agent_events::{
    normalize_effort_for_claude, resolve_effort, AgentEvent, AgentEventKind, EventAggregator,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_registry_registers_all_five_backends() {
        let registry = build_registry().await;
        let mut names = registry.list().await;
        names.sort();
        assert_eq!(names, vec!["claude", "codex", "copilot", "gemini", "opencode"]);
    }

    #[tokio::test]
    async fn each_built_in_backend_is_constructible() {
        let registry = build_registry().await;
        for name in ["claude", "gemini", "codex", "copilot", "opencode"] {
            let agent = registry.get(name).await.unwrap();
            assert_eq!(agent.name(), name);
        }
    }

    #[tokio::test]
    async fn get_caches_the_same_instance_across_backends() {
        let registry = build_registry().await;
        let first = registry.get("claude").await.unwrap();
        let second = registry.get("claude").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
