use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::warn;

use crate::agent_trait::{Agent, Diagnostics, EventHandler, LogCallback};
use crate::config::AgentConfig;
use crate::error::AgentError;

pub type AgentFactory = Arc<dyn Fn(AgentConfig) -> Result<Arc<dyn Agent>, AgentError> + Send + Sync>;

const BUILT_IN_NAMES: &[&str] = &["claude", "gemini", "codex", "copilot", "opencode"];

fn default_config_for(name: &str) -> AgentConfig {
    let mut config = AgentConfig::new(name, name);
    config.timeout = Duration::from_secs(300);
    config
}

/// Owns every backend's factory, resolved configuration, and any already
/// constructed (and therefore cached) [`Agent`]. A cached agent is reused
/// across `get` calls until `configure` evicts it.
pub struct Registry {
    factories: RwLock<HashMap<String, AgentFactory>>,
    configs: RwLock<HashMap<String, AgentConfig>>,
    cache: RwLock<HashMap<String, Arc<dyn Agent>>>,
    event_handler: RwLock<Option<EventHandler>>,
    log_callback: RwLock<Option<LogCallback>>,
    diagnostics: RwLock<Option<Arc<dyn Diagnostics>>>,
}

impl Registry {
    /// A registry with no factories registered but default configs present
    /// for the five built-in backend names, so `configure` on a known name
    /// before `register_factory` still has sane defaults to merge into.
    pub fn new() -> Self {
        let mut configs = HashMap::new();
        for name in BUILT_IN_NAMES {
            configs.insert(name.to_string(), default_config_for(name));
        }
        Self {
            factories: RwLock::new(HashMap::new()),
            configs: RwLock::new(configs),
            cache: RwLock::new(HashMap::new()),
            event_handler: RwLock::new(None),
            log_callback: RwLock::new(None),
            diagnostics: RwLock::new(None),
        }
    }

    pub async fn register_factory(&self, name: impl Into<String>, factory: AgentFactory) {
        let name = name.into();
        self.configs
            .write()
            .await
            .entry(name.clone())
            .or_insert_with(|| default_config_for(&name));
        self.factories.write().await.insert(name.clone(), factory);
        self.cache.write().await.remove(&name);
    }

    /// Registers an already-constructed agent directly, bypassing the
    /// factory/config path entirely (useful for tests and one-off backends).
    pub async fn register(&self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        self.cache.write().await.insert(name, agent);
    }

    /// Replaces a backend's configuration and evicts any cached instance so
    /// the next `get` rebuilds it with the new settings.
    pub async fn configure(&self, name: impl Into<String>, config: AgentConfig) {
        let name = name.into();
        self.configs.write().await.insert(name.clone(), config);
        self.cache.write().await.remove(&name);
    }

    pub async fn has(&self, name: &str) -> bool {
        self.factories.read().await.contains_key(name) || self.cache.read().await.contains_key(name)
    }

    /// Returns the cached agent for `name`, constructing and caching one via
    /// its factory and resolved config if none exists yet.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Agent>, AgentError> {
        if let Some(agent) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(agent));
        }

        let factory = self
            .factories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound { path: name.to_string() })?;
        let config = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_else(|| default_config_for(name));

        let agent = factory(config)?;
        if let Some(handler) = self.event_handler.read().await.clone() {
            agent.set_event_handler(Some(handler));
        }
        if let Some(callback) = self.log_callback.read().await.clone() {
            agent.set_log_callback(Some(callback));
        }

        self.cache.write().await.insert(name.to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().await.keys().cloned().collect();
        for cached in self.cache.read().await.keys() {
            if !names.contains(cached) {
                names.push(cached.clone());
            }
        }
        names.sort();
        names
    }

    /// Backends not fully disabled: either unconstrained by any phase map,
    /// or enabled for at least one phase.
    pub async fn list_enabled(&self) -> Vec<String> {
        let configs = self.configs.read().await;
        self.list()
            .await
            .into_iter()
            .filter(|name| match configs.get(name).and_then(|c| c.phases.as_ref()) {
                None => true,
                Some(map) => map.values().any(|enabled| *enabled),
            })
            .collect()
    }

    pub async fn list_enabled_for_phase(&self, phase: &str) -> Vec<String> {
        let configs = self.configs.read().await;
        self.list()
            .await
            .into_iter()
            .filter(|name| {
                configs
                    .get(name)
                    .map(|c| c.is_enabled_for_phase(phase))
                    .unwrap_or(true)
            })
            .collect()
    }

    pub async fn ping(&self, name: &str) -> Result<(), AgentError> {
        self.get(name).await?.ping().await
    }

    /// Pings every known backend concurrently. Snapshots the name list first
    /// so a slow factory constructing one agent doesn't hold the registry
    /// locks while another backend's liveness check runs, then fans the
    /// pings out together so one slow or panicking backend cannot delay or
    /// suppress the others' results.
    pub async fn ping_all(&self) -> HashMap<String, Result<(), AgentError>> {
        let names = self.list().await;
        let pings = names.into_iter().map(|name| async move {
            let outcome = std::panic::AssertUnwindSafe(self.ping(&name))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(AgentError::ExecutionFailed {
                        agent: name.clone(),
                        detail: "ping panicked".to_string(),
                    })
                });
            (name, outcome)
        });
        futures::future::join_all(pings).await.into_iter().collect()
    }

    /// Names whose `ping` succeeded, per §4.4 `available(ctx)`.
    pub async fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ping_all()
            .await
            .into_iter()
            .filter_map(|(name, result)| result.is_ok().then_some(name))
            .collect();
        names.sort();
        names
    }

    /// `available() ∩ listEnabledForPhase(phase)`, per §4.4.
    pub async fn available_for_phase(&self, phase: &str) -> Vec<String> {
        let enabled = self.list_enabled_for_phase(phase).await;
        self.available()
            .await
            .into_iter()
            .filter(|name| enabled.contains(name))
            .collect()
    }

    pub async fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.event_handler.write().await = handler.clone();
        for agent in self.cache.read().await.values() {
            agent.set_event_handler(handler.clone());
        }
    }

    pub async fn set_log_callback(&self, callback: Option<LogCallback>) {
        *self.log_callback.write().await = callback.clone();
        for agent in self.cache.read().await.values() {
            agent.set_log_callback(callback.clone());
        }
    }

    pub async fn set_diagnostics(&self, diagnostics: Option<Arc<dyn Diagnostics>>) {
        *self.diagnostics.write().await = diagnostics;
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
        warn!("registry cache cleared, all agents will be rebuilt on next get()");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::options::ExecuteOptions;
    use crate::result::ExecuteResult;
    use std::time::Duration as StdDuration;

    struct StubAgent {
        config: AgentConfig,
    }

    #[async_trait::async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            &self.config.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_images: false,
                supports_tools: false,
                max_context_tokens: 0,
                max_output_tokens: 0,
                supported_models: vec![],
                default_model: String::new(),
            }
        }

        fn config(&self) -> &AgentConfig {
            &self.config
        }

        async fn ping(&self) -> Result<(), AgentError> {
            Ok(())
        }

        async fn execute(&self, _options: ExecuteOptions) -> Result<ExecuteResult, AgentError> {
            Ok(ExecuteResult {
                output: "stub".to_string(),
                parsed: None,
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                duration: StdDuration::from_secs(0),
                model: String::new(),
            })
        }
    }

    fn stub_factory() -> AgentFactory {
        Arc::new(|config| Ok(Arc::new(StubAgent { config }) as Arc<dyn Agent>))
    }

    struct PanickingPingAgent {
        config: AgentConfig,
    }

    #[async_trait::async_trait]
    impl Agent for PanickingPingAgent {
        fn name(&self) -> &str {
            &self.config.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_images: false,
                supports_tools: false,
                max_context_tokens: 0,
                max_output_tokens: 0,
                supported_models: vec![],
                default_model: String::new(),
            }
        }

        fn config(&self) -> &AgentConfig {
            &self.config
        }

        async fn ping(&self) -> Result<(), AgentError> {
            panic!("boom")
        }

        async fn execute(&self, _options: ExecuteOptions) -> Result<ExecuteResult, AgentError> {
            Ok(ExecuteResult {
                output: "stub".to_string(),
                parsed: None,
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                duration: StdDuration::from_secs(0),
                model: String::new(),
            })
        }
    }

    fn panicking_ping_factory() -> AgentFactory {
        Arc::new(|config| Ok(Arc::new(PanickingPingAgent { config }) as Arc<dyn Agent>))
    }

    struct FailingPingAgent {
        config: AgentConfig,
    }

    #[async_trait::async_trait]
    impl Agent for FailingPingAgent {
        fn name(&self) -> &str {
            &self.config.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_images: false,
                supports_tools: false,
                max_context_tokens: 0,
                max_output_tokens: 0,
                supported_models: vec![],
                default_model: String::new(),
            }
        }

        fn config(&self) -> &AgentConfig {
            &self.config
        }

        async fn ping(&self) -> Result<(), AgentError> {
            Err(AgentError::NotFound {
                path: self.config.path.clone(),
            })
        }

        async fn execute(&self, _options: ExecuteOptions) -> Result<ExecuteResult, AgentError> {
            Ok(ExecuteResult {
                output: "stub".to_string(),
                parsed: None,
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                duration: StdDuration::from_secs(0),
                model: String::new(),
            })
        }
    }

    fn failing_ping_factory() -> AgentFactory {
        Arc::new(|config| Ok(Arc::new(FailingPingAgent { config }) as Arc<dyn Agent>))
    }

    #[tokio::test]
    async fn get_caches_the_same_instance() {
        let registry = Registry::new();
        registry.register_factory("claude", stub_factory()).await;

        let first = registry.get("claude").await.unwrap();
        let second = registry.get("claude").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn configure_evicts_the_cache() {
        let registry = Registry::new();
        registry.register_factory("claude", stub_factory()).await;

        let first = registry.get("claude").await.unwrap();
        registry.configure("claude", AgentConfig::new("claude", "claude")).await;
        let second = registry.get("claude").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unknown_backend_is_not_found() {
        let registry = Registry::new();
        let err = registry.get("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_enabled_for_phase_honours_phase_flags() {
        let registry = Registry::new();
        registry.register_factory("claude", stub_factory()).await;
        let mut phases = HashMap::new();
        phases.insert("execute".to_string(), false);
        phases.insert("analyze".to_string(), true);
        let mut config = AgentConfig::new("claude", "claude");
        config.phases = Some(phases);
        registry.configure("claude", config).await;

        let enabled = registry.list_enabled_for_phase("execute").await;
        assert!(!enabled.contains(&"claude".to_string()));
        let enabled = registry.list_enabled_for_phase("analyze").await;
        assert!(enabled.contains(&"claude".to_string()));
    }

    #[tokio::test]
    async fn ping_all_returns_every_name_even_when_one_panics() {
        let registry = Registry::new();
        registry.register_factory("claude", stub_factory()).await;
        registry.register_factory("gemini", stub_factory()).await;
        registry.register_factory("codex", panicking_ping_factory()).await;

        let results = registry.ping_all().await;

        assert_eq!(results.len(), 3);
        assert!(results["claude"].is_ok());
        assert!(results["gemini"].is_ok());
        assert!(results["codex"].is_err());
    }

    #[tokio::test]
    async fn available_excludes_backends_whose_ping_fails() {
        let registry = Registry::new();
        registry.register_factory("claude", stub_factory()).await;
        registry.register_factory("codex", failing_ping_factory()).await;

        let available = registry.available().await;
        assert!(available.contains(&"claude".to_string()));
        assert!(!available.contains(&"codex".to_string()));
    }

    #[tokio::test]
    async fn available_for_phase_intersects_availability_and_phase_enablement() {
        let registry = Registry::new();
        registry.register_factory("claude", stub_factory()).await;
        registry.register_factory("codex", failing_ping_factory()).await;

        let mut phases = HashMap::new();
        phases.insert("execute".to_string(), true);
        let mut claude_config = AgentConfig::new("claude", "claude");
        claude_config.phases = Some(phases.clone());
        registry.configure("claude", claude_config).await;
        let mut codex_config = AgentConfig::new("codex", "codex");
        codex_config.phases = Some(phases);
        registry.configure("codex", codex_config).await;

        let available = registry.available_for_phase("execute").await;
        assert!(available.contains(&"claude".to_string()));
        assert!(!available.contains(&"codex".to_string()), "codex is enabled for the phase but dead, so it must not be reported available");
    }
}
