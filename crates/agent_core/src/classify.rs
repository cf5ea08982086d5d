use serde_json::Value;

use agent_events::{AgentEvent, AgentEventKind};

/// Behavioural failure category inferred from stderr text. Distinct from
/// [`crate::error::AgentError`]: this is the raw classification signal an
/// adapter/executor turns into a concrete error variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StderrErrorKind {
    RateLimit,
    Auth,
    Network,
    OutputTooLong,
    Unknown,
}

/// Maps stderr substrings to a failure kind. Matching is case-insensitive
/// and order-sensitive: the first matching
/// category wins.
pub fn classify_stderr(stderr: &str) -> StderrErrorKind {
    let lower = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["rate", "quota", "429", "throttl"]) {
        StderrErrorKind::RateLimit
    } else if any(&["unauth", "401", "403", "forbidden"]) {
        StderrErrorKind::Auth
    } else if any(&["unreachable", "timeout", "connection"]) {
        StderrErrorKind::Network
    } else if any(&["output tokens", "max output", "context length", "too many tokens"]) {
        StderrErrorKind::OutputTooLong
    } else {
        StderrErrorKind::Unknown
    }
}

/// Looks for an embedded structured error payload in backend output: either
/// a bare `{"error": ...}` object or the claude-style
/// `{"type":"result","subtype":"error","error":...}` envelope. Scans
/// line-by-line since backend output may mix plain text and JSON lines.
pub fn extract_structured_error(text: &str) -> Option<String> {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        if let Some(message) = structured_error_message(&value) {
            return Some(message);
        }
    }
    None
}

fn structured_error_message(value: &Value) -> Option<String> {
    let is_error_result = value.get("type").and_then(Value::as_str) == Some("result")
        && value.get("subtype").and_then(Value::as_str) == Some("error");
    let error_field = value.get("error");
    if is_error_result || error_field.is_some() {
        let error_field = error_field?;
        return match error_field {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        };
    }
    None
}

const TOOL_USE_MARKERS: &[&str] = &[
    "reading",
    "writing",
    "executing",
    "running",
    "searching",
    "analyzing",
    "tool:",
    "fetching",
];
const THINKING_MARKERS: &[&str] = &["thinking", "reasoning"];
const MAX_MESSAGE_LEN: usize = 50;

/// Classifies one stderr line into an `AgentEvent`, or `None` when the line
/// carries no recognizable signal.
pub fn classify_stderr_line(agent: &str, line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let kind = if TOOL_USE_MARKERS.iter().any(|m| lower.contains(m)) {
        AgentEventKind::ToolUse
    } else if THINKING_MARKERS.iter().any(|m| lower.contains(m)) {
        AgentEventKind::Thinking
    } else {
        return None;
    };
    Some(AgentEvent::new(kind, agent, truncate_message(trimmed)))
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        message.to_string()
    } else {
        let truncated: String = message.chars().take(MAX_MESSAGE_LEN).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_auth_network_output_too_long() {
        assert_eq!(classify_stderr("Error: 429 too many requests"), StderrErrorKind::RateLimit);
        assert_eq!(classify_stderr("401 Unauthorized"), StderrErrorKind::Auth);
        assert_eq!(classify_stderr("connection reset by peer"), StderrErrorKind::Network);
        assert_eq!(
            classify_stderr("context length exceeded for this model"),
            StderrErrorKind::OutputTooLong
        );
        assert_eq!(classify_stderr("something else entirely"), StderrErrorKind::Unknown);
    }

    #[test]
    fn extracts_bare_error_object() {
        let text = "some banner\n{\"error\": \"boom\"}\nmore text";
        assert_eq!(extract_structured_error(text), Some("boom".to_string()));
    }

    #[test]
    fn extracts_claude_style_result_error_envelope() {
        let text = r#"{"type":"result","subtype":"error","error":"rate limited"}"#;
        assert_eq!(extract_structured_error(text), Some("rate limited".to_string()));
    }

    #[test]
    fn plain_text_has_no_structured_error() {
        assert_eq!(extract_structured_error("just some output, no json here"), None);
    }

    #[test]
    fn stderr_lines_classify_tool_use_and_thinking() {
        let tool = classify_stderr_line("claude", "Reading file foo.rs").unwrap();
        assert_eq!(tool.kind, AgentEventKind::ToolUse);
        let thinking = classify_stderr_line("claude", "Thinking about the approach").unwrap();
        assert_eq!(thinking.kind, AgentEventKind::Thinking);
        assert!(classify_stderr_line("claude", "plain diagnostic line").is_none());
    }

    #[test]
    fn long_messages_are_truncated_to_fifty_chars_plus_ellipsis() {
        let long_line = format!("Running {}", "x".repeat(100));
        let event = classify_stderr_line("claude", &long_line).unwrap();
        assert_eq!(event.message.chars().count(), 51);
        assert!(event.message.ends_with('…'));
    }
}
