#![forbid(unsafe_code)]
//! Adapter for the `gemini` CLI backend.
//!
//! Argv: `--model M --approval-mode yolo [--output-format json]`; the prompt
//! is delivered over stdin rather than argv. Gemini carries no web-search
//! toggle in its backend contract (unlike codex's `web_search`), so the
//! adapter has no equivalent flag to thread through.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use agent_core::{
    classify_exit, estimate_cost, execute_with_diagnostics, extract_and_validate_tokens, strip_ansi,
    Agent, AgentConfig, AgentError, BaseExecutor, Capabilities, Diagnostics, EventHandler,
    ExecuteOptions, ExecuteRequest, ExecuteResult, LogCallback, StreamConfig, StreamingRequest,
};
use agent_events::{EventAggregator, JsonLineStreamParser};

const COST_IN_PER_MTOK: f64 = 0.075;
const COST_OUT_PER_MTOK: f64 = 0.30;
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const JSON_STREAM_FLAGS: [&str; 2] = ["--output-format", "json"];

pub fn capabilities() -> Capabilities {
    Capabilities {
        supports_json: true,
        supports_streaming: true,
        supports_images: true,
        supports_tools: true,
        max_context_tokens: 1_000_000,
        max_output_tokens: 8_192,
        supported_models: vec!["gemini-2.5-pro".to_string(), "gemini-2.5-flash".to_string()],
        default_model: "gemini-2.5-pro".to_string(),
    }
}

fn build_args(config: &AgentConfig, opts: &ExecuteOptions) -> Vec<String> {
    let model = opts
        .model
        .clone()
        .or_else(|| config.default_model.clone())
        .unwrap_or_else(|| capabilities().default_model);

    vec![
        "--model".to_string(),
        model,
        "--approval-mode".to_string(),
        "yolo".to_string(),
    ]
}

pub struct GeminiAdapterBuilder {
    config: AgentConfig,
    executor: Option<Arc<BaseExecutor>>,
}

impl GeminiAdapterBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            executor: None,
        }
    }

    pub fn executor(mut self, executor: Arc<BaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> GeminiAdapter {
        GeminiAdapter {
            config: self.config,
            executor: self.executor.unwrap_or_default(),
            event_handler: SyncMutex::new(None),
            log_callback: SyncMutex::new(None),
            diagnostics: SyncMutex::new(None),
            execute_lock: AsyncMutex::new(()),
        }
    }
}

pub struct GeminiAdapter {
    config: AgentConfig,
    executor: Arc<BaseExecutor>,
    event_handler: SyncMutex<Option<EventHandler>>,
    log_callback: SyncMutex<Option<LogCallback>>,
    diagnostics: SyncMutex<Option<Arc<dyn Diagnostics>>>,
    execute_lock: AsyncMutex<()>,
}

impl GeminiAdapter {
    pub fn builder(config: AgentConfig) -> GeminiAdapterBuilder {
        GeminiAdapterBuilder::new(config)
    }

    fn executable(&self) -> Vec<String> {
        self.config.executable_parts()
    }
}

#[async_trait]
impl Agent for GeminiAdapter {
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

        let args = build_args(&self.config, &opts);
        let request = ExecuteRequest {
            executable: self.executable(),
            args,
            stdin: Some(opts.prompt.clone().into_bytes()),
            work_dir: opts.work_dir.clone(),
            env: HashMap::new(),
        };

        let agent_name = self.config.name.clone();
        let streaming_request = StreamingRequest {
            agent: agent_name.clone(),
            request,
            timeout: opts.timeout.unwrap_or(self.config.timeout),
            idle_timeout: self.config.idle_timeout,
            stream: StreamConfig::json_stdout(JSON_STREAM_FLAGS.map(str::to_string)),
            parser_factory: Arc::new(move || {
                Box::new(JsonLineStreamParser::new(agent_name.clone())) as Box<_>
            }),
            aggregator: Arc::new(AsyncMutex::new(EventAggregator::default())),
            handler: self.event_handler.lock().expect("lock poisoned").clone(),
            capture: None,
        };

        let diagnostics = self.diagnostics.lock().expect("lock poisoned").clone();
        let result = execute_with_diagnostics(&self.executor, streaming_request, diagnostics).await?;

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

        let model = opts
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| capabilities().default_model);

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
            GeminiAdapter::builder(config).executor(Arc::clone(&executor)).build(),
        ) as Arc<dyn Agent>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_carries_model_and_approval_mode() {
        let config = AgentConfig::new("gemini", "gemini");
        let mut opts = ExecuteOptions::new("hello");
        opts.model = Some("gemini-2.5-flash".to_string());
        let args = build_args(&config, &opts);
        assert_eq!(
            args,
            vec!["--model", "gemini-2.5-flash", "--approval-mode", "yolo"]
        );
    }

    #[test]
    fn falls_back_to_default_model_when_unset() {
        let config = AgentConfig::new("gemini", "gemini");
        let opts = ExecuteOptions::new("hello");
        let args = build_args(&config, &opts);
        assert_eq!(args[1], capabilities().default_model);
    }

    #[test]
    fn cost_calc_matches_published_rates() {
        assert!((estimate_cost(1_000_000, 1_000_000, COST_IN_PER_MTOK, COST_OUT_PER_MTOK) - 0.375).abs() < 1e-9);
    }
}
