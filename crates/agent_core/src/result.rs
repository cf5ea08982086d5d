use std::process::ExitStatus;
use std::time::Duration;

use serde_json::Value;

pub const MAX_TOKEN_VALUE: u64 = 500_000;

/// Raw child-process output before an adapter's backend-specific
/// post-processing (token extraction, cost, cleanup).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<ExitStatus>,
    pub duration: Duration,
}

impl CommandResult {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Normalized, backend-agnostic result handed back to `Agent::execute`
/// callers.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub output: String,
    pub parsed: Option<Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub duration: Duration,
    pub model: String,
}
