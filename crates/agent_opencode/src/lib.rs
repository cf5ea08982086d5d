#![forbid(unsafe_code)]
//! Adapter for the `opencode` CLI backend.
//!
//! Argv: `run [--model M]`, prompt delivered as the final argv element, no
//! streaming artefact (buffered like any `StreamMethod::None` backend).
//! Unlike the other backends, opencode has no single default model: absent
//! an explicit override, the adapter classifies the prompt into a **coder**
//! or **architect** profile via closed-vocabulary keyword scoring and picks
//! a model accordingly, then checks an Ollama-style `/api/tags` endpoint to
//! confirm the chosen model is actually pulled before using it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use agent_core::{
    classify_exit, estimate_cost, execute_command_with_diagnostics, extract_and_validate_tokens,
    strip_ansi, Agent, AgentConfig, AgentError, BaseExecutor, Capabilities, Diagnostics, EventHandler,
    ExecuteOptions, ExecuteRequest, ExecuteResult, LogCallback,
};

const COST_IN_PER_MTOK: f64 = 0.0;
const COST_OUT_PER_MTOK: f64 = 0.0;
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";

const CODER_KEYWORDS: &[&str] = &[
    "create", "implement", "fix", "debug", "refactor", "code", "function", "script",
];
const ARCHITECT_KEYWORDS: &[&str] = &[
    "analyze", "plan", "design", "audit", "review", "strategy", "compare", "evaluate", "pros", "cons",
];

pub fn capabilities() -> Capabilities {
    Capabilities {
        supports_json: false,
        supports_streaming: false,
        supports_images: false,
        supports_tools: true,
        max_context_tokens: 32_768,
        max_output_tokens: 8_192,
        supported_models: vec!["qwen2.5-coder:32b".to_string(), "deepseek-r1:32b".to_string()],
        default_model: "qwen2.5-coder:32b".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PromptProfile {
    Coder,
    Architect,
}

impl PromptProfile {
    pub fn model(self) -> &'static str {
        match self {
            PromptProfile::Coder => "qwen2.5-coder:32b",
            PromptProfile::Architect => "deepseek-r1:32b",
        }
    }
}

fn tokenize(prompt: &str) -> Vec<String> {
    prompt
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn score(tokens: &[String], keywords: &[&str]) -> usize {
    tokens
        .iter()
        .filter(|token| keywords.iter().any(|keyword| token.starts_with(keyword)))
        .count()
}

/// Classifies a prompt into a coder/architect profile via closed-vocabulary
/// keyword scoring. Ties break to coder.
pub fn classify_prompt(prompt: &str) -> PromptProfile {
    let tokens = tokenize(prompt);
    let coder_score = score(&tokens, CODER_KEYWORDS);
    let architect_score = score(&tokens, ARCHITECT_KEYWORDS);
    if architect_score > coder_score {
        PromptProfile::Architect
    } else {
        PromptProfile::Coder
    }
}

/// Confirms a classified/configured model is actually available before use.
/// Implementations that cannot reach the endpoint should fail open (treat
/// the model as available) rather than block execution on an advisory
/// check.
#[async_trait]
pub trait ModelAvailabilityProbe: Send + Sync {
    async fn is_available(&self, model: &str) -> bool;
}

/// Default probe: queries an Ollama-compatible `/api/tags` endpoint and
/// checks whether `model` appears in the returned tag list.
pub struct OllamaProbe {
    endpoint: String,
    client: reqwest::Client,
}

impl OllamaProbe {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OllamaProbe {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_ENDPOINT)
    }
}

#[async_trait]
impl ModelAvailabilityProbe for OllamaProbe {
    async fn is_available(&self, model: &str) -> bool {
        let url = format!("{}/api/tags", self.endpoint.trim_end_matches('/'));
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, %url, "could not reach model endpoint, assuming model is available");
                return true;
            }
        };
        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(_) => return true,
        };
        let Some(models) = body.get("models").and_then(serde_json::Value::as_array) else {
            return true;
        };
        models
            .iter()
            .filter_map(|entry| entry.get("name").and_then(serde_json::Value::as_str))
            .any(|name| name == model)
    }
}

/// Resolves the model for one invocation: explicit override > configured
/// default > prompt classifier.
pub fn resolve_model(config: &AgentConfig, opts: &ExecuteOptions) -> String {
    opts.model
        .clone()
        .or_else(|| config.default_model.clone())
        .unwrap_or_else(|| classify_prompt(&opts.prompt).model().to_string())
}

fn build_args(model: &str) -> Vec<String> {
    vec!["run".to_string(), "--model".to_string(), model.to_string()]
}

pub struct OpencodeAdapterBuilder {
    config: AgentConfig,
    executor: Option<Arc<BaseExecutor>>,
    probe: Option<Arc<dyn ModelAvailabilityProbe>>,
}

impl OpencodeAdapterBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            executor: None,
            probe: None,
        }
    }

    pub fn executor(mut self, executor: Arc<BaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ModelAvailabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> OpencodeAdapter {
        OpencodeAdapter {
            config: self.config,
            executor: self.executor.unwrap_or_default(),
            probe: self.probe.unwrap_or_else(|| Arc::new(OllamaProbe::default())),
            event_handler: SyncMutex::new(None),
            log_callback: SyncMutex::new(None),
            diagnostics: SyncMutex::new(None),
            execute_lock: AsyncMutex::new(()),
        }
    }
}

pub struct OpencodeAdapter {
    config: AgentConfig,
    executor: Arc<BaseExecutor>,
    probe: Arc<dyn ModelAvailabilityProbe>,
    event_handler: SyncMutex<Option<EventHandler>>,
    log_callback: SyncMutex<Option<LogCallback>>,
    diagnostics: SyncMutex<Option<Arc<dyn Diagnostics>>>,
    execute_lock: AsyncMutex<()>,
}

impl OpencodeAdapter {
    pub fn builder(config: AgentConfig) -> OpencodeAdapterBuilder {
        OpencodeAdapterBuilder::new(config)
    }

    fn executable(&self) -> Vec<String> {
        self.config.executable_parts()
    }
}

#[async_trait]
impl Agent for OpencodeAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Capabilities {
        capabilities()
    }

    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn ping(&self) -> Result<(), AgentError> {
        let request = ExecuteRequest {
            executable: self.executable(),
            args: vec!["--version".to_string()],
            stdin: None,
            work_dir: None,
            env: HashMap::new(),
        };
        self.executor
            .execute_command(&self.config.name, &request, PING_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|_| AgentError::NotFound {
                path: self.config.path.clone(),
            })
    }

    async fn execute(&self, opts: ExecuteOptions) -> Result<ExecuteResult, AgentError> {
        let _permit = self.execute_lock.lock().await;

        let model = resolve_model(&self.config, &opts);
        if !self.probe.is_available(&model).await {
            warn!(agent = %self.config.name, %model, "classified/configured model was not reported available");
        }

        let mut args = build_args(&model);
        args.push(opts.prompt.clone());

        let request = ExecuteRequest {
            executable: self.executable(),
            args,
            stdin: None,
            work_dir: opts.work_dir.clone(),
            env: HashMap::new(),
        };

        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let diagnostics = self.diagnostics.lock().expect("lock poisoned").clone();
        let result =
            execute_command_with_diagnostics(&self.executor, &self.config.name, &request, timeout, diagnostics)
                .await?;

        let stdout_text = strip_ansi(&result.stdout_text());
        classify_exit(&self.config.name, &result, &stdout_text)?;

        let combined = format!("{stdout_text}\n{}", result.stderr_text());
        let extraction = extract_and_validate_tokens(
            &self.config.name,
            &combined,
            &stdout_text,
            self.config.token_discrepancy_threshold,
        );
        if let Some(handler) = self.event_handler.lock().expect("lock poisoned").clone() {
            for warning in extraction.warnings {
                handler(warning);
            }
        }

        Ok(ExecuteResult {
            output: stdout_text,
            parsed: None,
            tokens_in: extraction.tokens_in,
            tokens_out: extraction.tokens_out,
            cost_usd: estimate_cost(
                extraction.tokens_in,
                extraction.tokens_out,
                COST_IN_PER_MTOK,
                COST_OUT_PER_MTOK,
            ),
            duration: result.duration,
            model,
        })
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.event_handler.lock().expect("lock poisoned") = handler;
    }

    fn set_log_callback(&self, callback: Option<LogCallback>) {
        *self.log_callback.lock().expect("lock poisoned") = callback;
    }

    fn with_diagnostics(self: Arc<Self>, diagnostics: Arc<dyn Diagnostics>) -> Arc<Self> {
        *self.diagnostics.lock().expect("lock poisoned") = Some(diagnostics);
        self
    }
}

pub fn factory(executor: Arc<BaseExecutor>) -> agent_core::AgentFactory {
    Arc::new(move |config: AgentConfig| {
        Ok(Arc::new(
            OpencodeAdapter::builder(config).executor(Arc::clone(&executor)).build(),
        ) as Arc<dyn Agent>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coder_keywords_classify_as_coder() {
        assert_eq!(classify_prompt("please fix this bug in the function"), PromptProfile::Coder);
        assert_eq!(classify_prompt("refactoring the module"), PromptProfile::Coder);
    }

    #[test]
    fn architect_keywords_classify_as_architect() {
        assert_eq!(
            classify_prompt("analyze the tradeoffs and design a strategy, weigh pros and cons"),
            PromptProfile::Architect
        );
    }

    #[test]
    fn ties_break_to_coder() {
        assert_eq!(classify_prompt("plan to implement"), PromptProfile::Coder);
    }

    #[test]
    fn neutral_prompt_defaults_to_coder() {
        assert_eq!(classify_prompt("hello there"), PromptProfile::Coder);
    }

    #[test]
    fn explicit_model_override_dominates_classifier() {
        let config = AgentConfig::new("opencode", "opencode");
        let mut opts = ExecuteOptions::new("analyze the strategy");
        opts.model = Some("custom-model".to_string());
        assert_eq!(resolve_model(&config, &opts), "custom-model");
    }

    #[test]
    fn configured_default_wins_over_classifier() {
        let mut config = AgentConfig::new("opencode", "opencode");
        config.default_model = Some("configured-model".to_string());
        let opts = ExecuteOptions::new("analyze the strategy");
        assert_eq!(resolve_model(&config, &opts), "configured-model");
    }

    #[test]
    fn classifier_picks_the_profiles_model_when_nothing_else_is_set() {
        let config = AgentConfig::new("opencode", "opencode");
        let opts = ExecuteOptions::new("fix this function");
        assert_eq!(resolve_model(&config, &opts), "qwen2.5-coder:32b");
    }

    struct AlwaysAvailable;
    #[async_trait]
    impl ModelAvailabilityProbe for AlwaysAvailable {
        async fn is_available(&self, _model: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn probe_trait_object_is_usable_through_arc_dyn() {
        let probe: Arc<dyn ModelAvailabilityProbe> = Arc::new(AlwaysAvailable);
        assert!(probe.is_available("anything").await);
    }
}
