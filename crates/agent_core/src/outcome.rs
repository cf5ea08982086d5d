use crate::classify::{classify_stderr, extract_structured_error, StderrErrorKind};
use crate::error::AgentError;
use crate::result::CommandResult;

/// Applies the exit-code policy: a non-zero exit with non-empty normalized
/// output is still a success (some backends report non-zero on
/// partial-but-useful completions); a non-zero exit with empty output is
/// classified from stderr (or an embedded structured error payload, which
/// wins when present).
pub fn classify_exit(agent: &str, result: &CommandResult, normalized_output: &str) -> Result<(), AgentError> {
    if result.success() {
        return Ok(());
    }
    if !normalized_output.trim().is_empty() {
        return Ok(());
    }

    let stderr = result.stderr_text();
    let combined = format!("{}\n{}", result.stdout_text(), stderr);
    let detail = extract_structured_error(&combined).unwrap_or_else(|| {
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            "process exited with a non-zero status and no output".to_string()
        } else {
            trimmed.to_string()
        }
    });

    Err(match classify_stderr(&stderr) {
        StderrErrorKind::RateLimit => AgentError::RateLimit { agent: agent.to_string(), detail },
        StderrErrorKind::Auth => AgentError::Auth { agent: agent.to_string(), detail },
        StderrErrorKind::Network => AgentError::Network { agent: agent.to_string(), detail },
        StderrErrorKind::OutputTooLong => AgentError::OutputTooLong { agent: agent.to_string(), detail },
        StderrErrorKind::Unknown => AgentError::ExecutionFailed { agent: agent.to_string(), detail },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // `std::process::ExitStatus` cannot be fabricated outside `std`, so these
    // tests exercise `CommandResult`s with no exit status at all — `success()`
    // treats that the same as a non-zero exit, which is the branch under test.
    fn result_with(stdout: &str, stderr: &str) -> CommandResult {
        CommandResult {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_status: None,
            duration: Duration::from_secs(0),
        }
    }

    #[test]
    fn nonzero_with_output_is_still_success() {
        let result = result_with("partial but useful", "");
        assert!(classify_exit("claude", &result, "partial but useful").is_ok());
    }

    #[test]
    fn nonzero_with_empty_output_and_rate_limit_stderr_is_classified() {
        let result = result_with("", "Error: 429 rate limit exceeded");
        let err = classify_exit("claude", &result, "").unwrap_err();
        assert!(matches!(err, AgentError::RateLimit { .. }));
    }

    #[test]
    fn structured_error_payload_wins_over_raw_stderr_text() {
        let result = result_with("", r#"{"error": "boom"}"#);
        let err = classify_exit("claude", &result, "").unwrap_err();
        assert!(matches!(err, AgentError::ExecutionFailed { ref detail, .. } if detail == "boom"));
    }
}
