#![forbid(unsafe_code)]
//! Adapter for the `copilot` (GitHub Copilot CLI) backend.
//!
//! Argv: `--allow-all-tools --allow-all-paths --allow-all-urls --silent`.
//! Copilot has no model flag (it manages its own model selection) and no
//! JSON output mode, so streaming is done by tailing the `*.log` files it
//! writes into a scratch directory passed via `--log-dir`. The prompt is
//! delivered on stdin, prefixed with `[System Instructions]` / `[User
//! Message]` sections when a system prompt is present.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use agent_core::{
    classify_exit, estimate_cost, execute_with_diagnostics, extract_and_validate_tokens, strip_ansi,
    strip_copilot_stats, Agent, AgentConfig, AgentError, BaseExecutor, Capabilities, Diagnostics,
    EventHandler, ExecuteOptions, ExecuteRequest, ExecuteResult, LogCallback, StreamConfig,
    StreamingRequest,
};
use agent_events::{AgentEvent, AgentEventKind, EventAggregator, JsonLineStreamParser};

/// No published per-token price for a flat-fee/subscription backend;
/// recorded as a deliberate Open Question decision in DESIGN.md.
const COST_IN_PER_MTOK: f64 = 0.0;
const COST_OUT_PER_MTOK: f64 = 0.0;
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_DIR_FLAG: &str = "--log-dir";

pub fn capabilities() -> Capabilities {
    Capabilities {
        supports_json: false,
        supports_streaming: true,
        supports_images: false,
        supports_tools: true,
        max_context_tokens: 128_000,
        max_output_tokens: 8_192,
        supported_models: vec![],
        default_model: String::new(),
    }
}

fn static_args() -> Vec<String> {
    vec![
        "--allow-all-tools".to_string(),
        "--allow-all-paths".to_string(),
        "--allow-all-urls".to_string(),
        "--silent".to_string(),
    ]
}

/// Builds the stdin payload: `[System Instructions]\n{system}\n\n[User
/// Message]\n{prompt}` when a system prompt is present, else the prompt
/// verbatim.
fn build_stdin(opts: &ExecuteOptions) -> Vec<u8> {
    match &opts.system_prompt {
        Some(system) => format!("[System Instructions]\n{system}\n\n[User Message]\n{}", opts.prompt),
        None => opts.prompt.clone(),
    }
    .into_bytes()
}

pub struct CopilotAdapterBuilder {
    config: AgentConfig,
    executor: Option<Arc<BaseExecutor>>,
}

impl CopilotAdapterBuilder {
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

    pub fn build(self) -> CopilotAdapter {
        CopilotAdapter {
            config: self.config,
            executor: self.executor.unwrap_or_default(),
            event_handler: SyncMutex::new(None),
            log_callback: SyncMutex::new(None),
            diagnostics: SyncMutex::new(None),
            execute_lock: AsyncMutex::new(()),
        }
    }
}

pub struct CopilotAdapter {
    config: AgentConfig,
    executor: Arc<BaseExecutor>,
    event_handler: SyncMutex<Option<EventHandler>>,
    log_callback: SyncMutex<Option<LogCallback>>,
    diagnostics: SyncMutex<Option<Arc<dyn Diagnostics>>>,
    execute_lock: AsyncMutex<()>,
}

impl CopilotAdapter {
    pub fn builder(config: AgentConfig) -> CopilotAdapterBuilder {
        CopilotAdapterBuilder::new(config)
    }

    fn executable(&self) -> Vec<String> {
        self.config.executable_parts()
    }
}

#[async_trait]
impl Agent for CopilotAdapter {
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

        let request = ExecuteRequest {
            executable: self.executable(),
            args: static_args(),
            stdin: Some(build_stdin(&opts)),
            work_dir: opts.work_dir.clone(),
            env: HashMap::new(),
        };

        let agent_name = self.config.name.clone();
        let streaming_request = StreamingRequest {
            agent: agent_name.clone(),
            request,
            timeout: opts.timeout.unwrap_or(self.config.timeout),
            idle_timeout: self.config.idle_timeout,
            stream: StreamConfig::log_file(LOG_DIR_FLAG),
            parser_factory: Arc::new(move || {
                Box::new(JsonLineStreamParser::new(agent_name.clone())) as Box<_>
            }),
            aggregator: Arc::new(AsyncMutex::new(EventAggregator::default())),
            handler: self.event_handler.lock().expect("lock poisoned").clone(),
            capture: None,
        };

        let diagnostics = self.diagnostics.lock().expect("lock poisoned").clone();
        let result = execute_with_diagnostics(&self.executor, streaming_request, diagnostics).await?;

        let cleaned = strip_copilot_stats(&strip_ansi(&result.stdout_text()));
        classify_exit(&self.config.name, &result, &cleaned)?;

        let combined = format!("{cleaned}\n{}", result.stderr_text());
        let extraction = extract_and_validate_tokens(
            &self.config.name,
            &combined,
            &cleaned,
            self.config.token_discrepancy_threshold,
        );

        let handler = self.event_handler.lock().expect("lock poisoned").clone();
        if let Some(handler) = &handler {
            for warning in extraction.warnings {
                handler(warning.clone());
            }
            let mut data = BTreeMap::new();
            data.insert(
                "duration_ms".to_string(),
                Value::from(result.duration.as_millis() as u64),
            );
            data.insert("tokens_in".to_string(), Value::from(extraction.tokens_in));
            data.insert("tokens_out".to_string(), Value::from(extraction.tokens_out));
            handler(
                AgentEvent::new(AgentEventKind::Completed, &self.config.name, "copilot run completed")
                    .with_data(data),
            );
        }

        Ok(ExecuteResult {
            output: cleaned,
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
            model: String::new(),
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
            CopilotAdapter::builder(config).executor(Arc::clone(&executor)).build(),
        ) as Arc<dyn Agent>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_without_system_prompt_is_the_prompt_verbatim() {
        let opts = ExecuteOptions::new("do the thing");
        assert_eq!(build_stdin(&opts), b"do the thing".to_vec());
    }

    #[test]
    fn stdin_with_system_prompt_wraps_both_sections() {
        let mut opts = ExecuteOptions::new("do the thing");
        opts.system_prompt = Some("be terse".to_string());
        let stdin = String::from_utf8(build_stdin(&opts)).unwrap();
        assert_eq!(
            stdin,
            "[System Instructions]\nbe terse\n\n[User Message]\ndo the thing"
        );
    }

    #[test]
    fn static_args_match_the_backend_contract() {
        let args = static_args();
        assert_eq!(
            args,
            vec!["--allow-all-tools", "--allow-all-paths", "--allow-all-urls", "--silent"]
        );
    }

    #[test]
    fn flat_fee_cost_is_always_zero() {
        assert_eq!(estimate_cost(500_000, 500_000, COST_IN_PER_MTOK, COST_OUT_PER_MTOK), 0.0);
    }
}
