use std::collections::BTreeMap;

use serde_json::Value;

/// The kind of signal an [`AgentEvent`] carries.
///
/// `Started` always opens a successful invocation's event sequence; `Completed`
/// or `Error` always closes it (see the base executor's state machine).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AgentEventKind {
    Started,
    Progress,
    Thinking,
    ToolUse,
    Chunk,
    Completed,
    Error,
}

/// A single normalized progress signal emitted during one `Execute` call.
///
/// `timestamp` is a logical counter assigned per invocation, not a wall-clock
/// value: it only needs to establish emission order within one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub kind: AgentEventKind,
    pub agent: String,
    pub message: String,
    pub data: Option<BTreeMap<String, Value>>,
    pub timestamp: u64,
}

impl AgentEvent {
    pub fn new(kind: AgentEventKind, agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            agent: agent.into(),
            message: message.into(),
            data: None,
            timestamp: 0,
        }
    }

    pub fn with_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }
}

/// Monotonic, per-invocation timestamp source. Never reads the wall clock —
/// event ordering only needs to be internally consistent, and a counter keeps
/// it deterministic for tests.
#[derive(Debug, Default)]
pub struct TimestampClock {
    next: u64,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn tick(&mut self) -> u64 {
        let now = self.next;
        self.next += 1;
        now
    }
}
