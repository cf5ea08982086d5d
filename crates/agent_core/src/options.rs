use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Input to `Agent::execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub model: Option<String>,
    pub format: OutputFormat,
    pub work_dir: Option<PathBuf>,
    pub phase: Option<String>,
    pub reasoning_effort: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}
