use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::event::{AgentEvent, AgentEventKind};

/// Filters the raw event stream before it reaches the subscriber so that
/// progress bursts don't overwhelm the caller while semantically meaningful
/// transitions always pass through.
///
/// Construct one per `Execute` invocation (the design notes call this out
/// explicitly) unless the owning adapter is guaranteed single-flight.
pub struct EventAggregator {
    /// Minimum spacing between two `Progress` events carrying the same
    /// message text.
    dedup_window: Duration,
    /// Minimum spacing between any two emissions of the same event kind,
    /// regardless of message — this is what bounds a steady burst to O(T).
    rate_limit_window: Duration,
    last_same_message: HashMap<AgentEventKind, (String, Instant)>,
    last_emit: HashMap<AgentEventKind, Instant>,
    seen_tools: HashSet<String>,
    seen_thinking: bool,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_millis(250))
    }
}

impl EventAggregator {
    pub fn new(dedup_window: Duration, rate_limit_window: Duration) -> Self {
        Self {
            dedup_window,
            rate_limit_window,
            last_same_message: HashMap::new(),
            last_emit: HashMap::new(),
            seen_tools: HashSet::new(),
            seen_thinking: false,
        }
    }

    /// Decide whether `event` should be forwarded to the subscriber. Must be
    /// called in event order; mutates internal dedup/rate-limit state.
    pub fn should_emit(&mut self, event: &AgentEvent) -> bool {
        let now = Instant::now();
        match event.kind {
            AgentEventKind::Started | AgentEventKind::Completed | AgentEventKind::Error => true,
            AgentEventKind::ToolUse => {
                let tool = event.data_str("tool").unwrap_or(&event.message);
                if self.seen_tools.insert(tool.to_string()) {
                    self.last_emit.insert(event.kind, now);
                    true
                } else {
                    self.rate_limited_pass(event.kind, now)
                }
            }
            AgentEventKind::Thinking => {
                if !self.seen_thinking {
                    self.seen_thinking = true;
                    self.last_emit.insert(event.kind, now);
                    true
                } else {
                    self.rate_limited_pass(event.kind, now)
                }
            }
            AgentEventKind::Progress => self.dedup_and_rate_limit(event, now),
            AgentEventKind::Chunk => self.rate_limited_pass(event.kind, now),
        }
    }

    fn dedup_and_rate_limit(&mut self, event: &AgentEvent, now: Instant) -> bool {
        if let Some((last_message, last_time)) = self.last_same_message.get(&event.kind) {
            if last_message == &event.message && now.duration_since(*last_time) < self.dedup_window
            {
                return false;
            }
        }
        if !self.rate_limited_pass(event.kind, now) {
            return false;
        }
        self.last_same_message
            .insert(event.kind, (event.message.clone(), now));
        true
    }

    fn rate_limited_pass(&mut self, kind: AgentEventKind, now: Instant) -> bool {
        match self.last_emit.get(&kind) {
            Some(last) if now.duration_since(*last) < self.rate_limit_window => false,
            _ => {
                self.last_emit.insert(kind, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(message: &str) -> AgentEvent {
        AgentEvent::new(AgentEventKind::Progress, "claude", message)
    }

    #[test]
    fn started_completed_error_always_pass() {
        let mut agg = EventAggregator::default();
        assert!(agg.should_emit(&AgentEvent::new(AgentEventKind::Started, "claude", "go")));
        assert!(agg.should_emit(&AgentEvent::new(AgentEventKind::Completed, "claude", "done")));
        assert!(agg.should_emit(&AgentEvent::new(AgentEventKind::Error, "claude", "boom")));
    }

    #[test]
    fn identical_progress_bursts_are_collapsed() {
        let mut agg = EventAggregator::new(Duration::from_secs(60), Duration::from_secs(60));
        assert!(agg.should_emit(&progress("thinking...")));
        for _ in 0..50 {
            assert!(!agg.should_emit(&progress("thinking...")));
        }
    }

    #[test]
    fn new_tool_name_always_passes_repeat_does_not() {
        let mut agg = EventAggregator::new(Duration::from_secs(60), Duration::from_secs(60));
        let mut grep = AgentEvent::new(AgentEventKind::ToolUse, "claude", "using tool: grep");
        let mut data = std::collections::BTreeMap::new();
        data.insert("tool".to_string(), serde_json::Value::String("grep".into()));
        grep = grep.with_data(data.clone());
        assert!(agg.should_emit(&grep));
        assert!(!agg.should_emit(&grep));

        let mut data2 = std::collections::BTreeMap::new();
        data2.insert("tool".to_string(), serde_json::Value::String("ls".into()));
        let ls = AgentEvent::new(AgentEventKind::ToolUse, "claude", "using tool: ls").with_data(data2);
        assert!(agg.should_emit(&ls));
    }

    #[test]
    fn steady_burst_is_bounded_not_proportional() {
        let mut agg = EventAggregator::new(Duration::from_millis(1), Duration::from_millis(1));
        let mut emitted = 0;
        for i in 0..1000 {
            if agg.should_emit(&progress(&format!("message-{i}"))) {
                emitted += 1;
            }
        }
        assert!(emitted < 1000);
    }
}
