#![forbid(unsafe_code)]
//! Adapter for the `codex` CLI backend.
//!
//! Argv: `exec --skip-git-repo-check -c approval_policy="never" -c
//! sandbox_mode="workspace-write" -c model_reasoning_effort="…" -c
//! skip_git_repo_check=true [--model M]`, with `--json` appended when a
//! streaming subscriber is installed and `-c web_search="disabled"` added
//! whenever the resolved effort is `minimal`. Prompt delivered over stdin.

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
use agent_events::{resolve_effort, EventAggregator, JsonLineStreamParser};

const COST_IN_PER_MTOK: f64 = 2.50;
const COST_OUT_PER_MTOK: f64 = 10.0;
const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub fn capabilities() -> Capabilities {
    Capabilities {
        supports_json: true,
        supports_streaming: true,
        supports_images: false,
        supports_tools: true,
        max_context_tokens: 400_000,
        max_output_tokens: 128_000,
        supported_models: vec!["gpt-5-codex".to_string(), "gpt-5".to_string()],
        default_model: "gpt-5-codex".to_string(),
    }
}

/// codex's phase-based reasoning-effort default: refine/analyze/plan run at
/// `xhigh`, execute at `high`.
fn phase_default_effort(phase: Option<&str>) -> Option<&'static str> {
    match phase {
        Some("refine") | Some("analyze") | Some("plan") => Some("xhigh"),
        Some("execute") => Some("high"),
        _ => None,
    }
}

fn resolve_codex_effort<'a>(config: &'a AgentConfig, opts: &'a ExecuteOptions) -> &'a str {
    resolve_effort(
        opts.reasoning_effort.as_deref(),
        opts.phase
            .as_deref()
            .and_then(|phase| config.reasoning_effort_phases.get(phase))
            .map(String::as_str),
        config.reasoning_effort.as_deref(),
        phase_default_effort(opts.phase.as_deref()),
    )
}

fn build_args(config: &AgentConfig, opts: &ExecuteOptions) -> Vec<String> {
    let effort = resolve_codex_effort(config, opts);

    let mut args = vec![
        "exec".to_string(),
        "--skip-git-repo-check".to_string(),
        "-c".to_string(),
        "approval_policy=\"never\"".to_string(),
        "-c".to_string(),
        "sandbox_mode=\"workspace-write\"".to_string(),
        "-c".to_string(),
        format!("model_reasoning_effort=\"{effort}\""),
        "-c".to_string(),
        "skip_git_repo_check=true".to_string(),
    ];

    if effort == "minimal" {
        args.push("-c".to_string());
        args.push("web_search=\"disabled\"".to_string());
    }

    if let Some(model) = opts.model.clone().or_else(|| config.default_model.clone()) {
        args.push("--model".to_string());
        args.push(model);
    }

    args
}

pub struct CodexAdapterBuilder {
    config: AgentConfig,
    executor: Option<Arc<BaseExecutor>>,
}

impl CodexAdapterBuilder {
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

    pub fn build(self) -> CodexAdapter {
        CodexAdapter {
            config: self.config,
            executor: self.executor.unwrap_or_default(),
            event_handler: SyncMutex::new(None),
            log_callback: SyncMutex::new(None),
            diagnostics: SyncMutex::new(None),
            execute_lock: AsyncMutex::new(()),
        }
    }
}

pub struct CodexAdapter {
    config: AgentConfig,
    executor: Arc<BaseExecutor>,
    event_handler: SyncMutex<Option<EventHandler>>,
    log_callback: SyncMutex<Option<LogCallback>>,
    diagnostics: SyncMutex<Option<Arc<dyn Diagnostics>>>,
    execute_lock: AsyncMutex<()>,
}

impl CodexAdapter {
    pub fn builder(config: AgentConfig) -> CodexAdapterBuilder {
        CodexAdapterBuilder::new(config)
    }

    fn executable(&self) -> Vec<String> {
        self.config.executable_parts()
    }
}

#[async_trait]
impl Agent for CodexAdapter {
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
            stream: StreamConfig::json_stdout(["--json".to_string()]),
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
            CodexAdapter::builder(config).executor(Arc::clone(&executor)).build(),
        ) as Arc<dyn Agent>)
    })
}
