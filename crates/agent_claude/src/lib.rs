#![forbid(unsafe_code)]
//! Adapter for the `claude` (Claude Code) CLI backend.
//!
//! Argv shape and streaming strategy are specified precisely — see the
//! backend contract table: `--print --dangerously-skip-permissions
//! [--model M] [--append-system-prompt S] <prompt-or-history>`, with
//! `--output-format stream-json` appended when a streaming subscriber is
//! installed, and reasoning effort carried via the `CLAUDE_CODE_EFFORT_LEVEL`
//! environment variable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use agent_core::{
    classify_exit, estimate_cost, execute_with_diagnostics, extract_and_validate_tokens, strip_ansi,
    Agent, AgentConfig, AgentError, BaseExecutor, Capabilities, Diagnostics, EventHandler,
    ExecuteOptions, ExecuteRequest, ExecuteResult, LogCallback, MessageRole, StreamConfig,
    StreamingRequest,
};
use agent_events::{resolve_effort, EventAggregator, JsonLineStreamParser};

const COST_IN_PER_MTOK: f64 = 3.0;
const COST_OUT_PER_MTOK: f64 = 15.0;
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Static capability table. `const fn`-constructible in spirit, but
/// `supported_models` needs a heap `Vec` so it is a plain function.
pub fn capabilities() -> Capabilities {
    Capabilities {
        supports_json: true,
        supports_streaming: true,
        supports_images: true,
        supports_tools: true,
        max_context_tokens: 200_000,
        max_output_tokens: 8_192,
        supported_models: vec![
            "claude-opus-4".to_string(),
            "claude-sonnet-4".to_string(),
            "claude-haiku-4".to_string(),
        ],
        default_model: "claude-sonnet-4".to_string(),
    }
}

/// Normalizes a phase name into claude's default reasoning effort when no
/// explicit override is configured. Claude has no phase-keyed default in the
/// backend contract table (that's codex's behaviour), so this always
/// returns `None` and exists only to keep the priority chain uniform across
/// adapters.
fn phase_default_effort(_phase: Option<&str>) -> Option<&'static str> {
    None
}

/// Wraps `opts.messages` into the `<conversation_history>` /
/// `<current_message>` envelope claude expects, or returns `opts.prompt`
/// verbatim when there is no history.
pub fn build_prompt_with_history(opts: &ExecuteOptions) -> String {
    if opts.messages.is_empty() {
        return opts.prompt.clone();
    }

    let mut out = String::from("<conversation_history>\n");
    for message in &opts.messages {
        match message.role {
            MessageRole::User => {
                out.push_str("<user>\n");
                out.push_str(&message.content);
                out.push_str("\n</user>\n");
            }
            MessageRole::Assistant => {
                out.push_str("<assistant>\n");
                out.push_str(&message.content);
                out.push_str("\n</assistant>\n");
            }
            MessageRole::System => {}
        }
    }
    out.push_str("</conversation_history>\n\n<current_message>\n");
    out.push_str(&opts.prompt);
    out.push_str("\n</current_message>");
    out
}

/// Builds the argv tail (everything after the executable) for one
/// invocation, and the environment additions (the effort-level variable).
fn build_args(config: &AgentConfig, opts: &ExecuteOptions) -> (Vec<String>, HashMap<String, String>) {
    let mut args = vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];

    let model = opts.model.clone().or_else(|| config.default_model.clone());
    if let Some(model) = &model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if let Some(system_prompt) = &opts.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt.clone());
    }

    args.push(build_prompt_with_history(opts));

    let mut env = HashMap::new();
    let effort = resolve_effort(
        opts.reasoning_effort.as_deref(),
        opts.phase
            .as_deref()
            .and_then(|phase| config.reasoning_effort_phases.get(phase))
            .map(String::as_str),
        config.reasoning_effort.as_deref(),
        phase_default_effort(opts.phase.as_deref()),
    );
    if !effort.is_empty() {
        env.insert(
            "CLAUDE_CODE_EFFORT_LEVEL".to_string(),
            agent_events::normalize_effort_for_claude(effort),
        );
    }

    (args, env)
}

pub struct ClaudeAdapterBuilder {
    config: AgentConfig,
    executor: Option<Arc<BaseExecutor>>,
}

impl ClaudeAdapterBuilder {
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

    pub fn build(self) -> ClaudeAdapter {
        ClaudeAdapter {
            config: self.config,
            executor: self.executor.unwrap_or_default(),
            event_handler: SyncMutex::new(None),
            log_callback: SyncMutex::new(None),
            diagnostics: SyncMutex::new(None),
            execute_lock: AsyncMutex::new(()),
        }
    }
}

/// Adapter for the `claude` backend. One in-flight `execute` at a time per
/// instance, enforced by `execute_lock`.
pub struct ClaudeAdapter {
    config: AgentConfig,
    executor: Arc<BaseExecutor>,
    event_handler: SyncMutex<Option<EventHandler>>,
    log_callback: SyncMutex<Option<LogCallback>>,
    diagnostics: SyncMutex<Option<Arc<dyn Diagnostics>>>,
    execute_lock: AsyncMutex<()>,
}

impl ClaudeAdapter {
    pub fn builder(config: AgentConfig) -> ClaudeAdapterBuilder {
        ClaudeAdapterBuilder::new(config)
    }

    fn executable(&self) -> Vec<String> {
        self.config.executable_parts()
    }
}

#[async_trait]
impl Agent for ClaudeAdapter {
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

        let (args, env) = build_args(&self.config, &opts);
        let request = ExecuteRequest {
            executable: self.executable(),
            args,
            stdin: None,
            work_dir: opts.work_dir.clone(),
            env,
        };

        let agent_name = self.config.name.clone();
        let streaming_request = StreamingRequest {
            agent: agent_name.clone(),
            request,
            timeout: opts.timeout.unwrap_or(self.config.timeout),
            idle_timeout: self.config.idle_timeout,
            stream: StreamConfig::json_stdout(["--output-format".to_string(), "stream-json".to_string()]),
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

        let stderr_text = result.stderr_text();
        let combined = format!("{stdout_text}\n{stderr_text}");
        let extraction = extract_and_validate_tokens(
            &self.config.name,
            &combined,
            &stdout_text,
            self.config.token_discrepancy_threshold,
        );
        let handler = self.event_handler.lock().expect("lock poisoned").clone();
        if let Some(handler) = handler {
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

/// Builds an `agent_core::AgentFactory` closure for registration with a
/// `Registry`, wiring a fresh adapter to a shared executor.
pub fn factory(executor: Arc<BaseExecutor>) -> agent_core::AgentFactory {
    Arc::new(move |config: AgentConfig| {
        Ok(Arc::new(
            ClaudeAdapter::builder(config).executor(Arc::clone(&executor)).build(),
        ) as Arc<dyn Agent>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::ConversationMessage;

    #[test]
    fn prompt_with_no_messages_is_verbatim() {
        let opts = ExecuteOptions::new("hello there");
        assert_eq!(build_prompt_with_history(&opts), "hello there");
    }

    #[test]
    fn prompt_with_history_wraps_roles() {
        let mut opts = ExecuteOptions::new("what now?");
        opts.messages = vec![
            ConversationMessage {
                role: MessageRole::User,
                content: "hi".to_string(),
            },
            ConversationMessage {
                role: MessageRole::Assistant,
                content: "hello".to_string(),
            },
            ConversationMessage {
                role: MessageRole::System,
                content: "ignored".to_string(),
            },
        ];
        let built = build_prompt_with_history(&opts);
        assert!(built.starts_with("<conversation_history>\n<user>\nhi\n</user>\n<assistant>\nhello\n</assistant>\n</conversation_history>"));
        assert!(built.ends_with("<current_message>\nwhat now?\n</current_message>"));
        assert!(!built.contains("ignored"));
    }

    #[test]
    fn build_args_includes_model_and_system_prompt() {
        let config = AgentConfig::new("claude", "claude");
        let mut opts = ExecuteOptions::new("do the thing");
        opts.model = Some("claude-opus-4".to_string());
        opts.system_prompt = Some("be terse".to_string());
        let (args, _env) = build_args(&config, &opts);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.windows(2).any(|w| w == ["--model", "claude-opus-4"]));
        assert!(args.windows(2).any(|w| w == ["--append-system-prompt", "be terse"]));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn effort_normalization_reaches_the_env_map() {
        let mut config = AgentConfig::new("claude", "claude");
        config.reasoning_effort = Some("xhigh".to_string());
        let opts = ExecuteOptions::new("go");
        let (_args, env) = build_args(&config, &opts);
        assert_eq!(env.get("CLAUDE_CODE_EFFORT_LEVEL").map(String::as_str), Some("max"));

        config.reasoning_effort = Some("minimal".to_string());
        let (_args, env) = build_args(&config, &opts);
        assert_eq!(env.get("CLAUDE_CODE_EFFORT_LEVEL").map(String::as_str), Some("low"));
    }

    #[test]
    fn explicit_call_override_wins_over_config_default() {
        let mut config = AgentConfig::new("claude", "claude");
        config.reasoning_effort = Some("low".to_string());
        let mut opts = ExecuteOptions::new("go");
        opts.reasoning_effort = Some("high".to_string());
        let (_args, env) = build_args(&config, &opts);
        assert_eq!(env.get("CLAUDE_CODE_EFFORT_LEVEL").map(String::as_str), Some("high"));
    }
}
