use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::{AgentEvent, AgentEventKind, TimestampClock};

/// Outcome of flushing a [`StreamParser`] at end-of-stream.
#[derive(Debug, Default)]
pub struct StreamFinish {
    pub events: Vec<AgentEvent>,
    /// Bytes left over that never formed a complete newline-terminated line
    /// and did not parse as a standalone JSON value. Not an error: callers
    /// may log it, tests may assert on it.
    pub incomplete_tail: Option<String>,
}

/// A stateful, append-only line parser: `parse_chunk` may be called any
/// number of times with arbitrarily-sized byte slices and must produce the
/// same event sequence as a single call over the concatenation of all chunks.
pub trait StreamParser {
    fn parse_chunk(&mut self, bytes: &[u8]) -> Vec<AgentEvent>;
    fn finish(&mut self) -> StreamFinish;
    fn reset(&mut self);
}

/// Generic newline-delimited-JSON parser shared by every `JSONStdout`
/// backend (claude, gemini, codex all emit the same closed `type`
/// vocabulary — see the backend contract table).
pub struct JsonLineStreamParser {
    agent: String,
    buffer: Vec<u8>,
    clock: TimestampClock,
}

impl JsonLineStreamParser {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            buffer: Vec::new(),
            clock: TimestampClock::new(),
        }
    }

    fn drain_complete_lines(&mut self, out: &mut Vec<AgentEvent>) {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line_bytes[..line_bytes.len() - 1];
            self.handle_line(line, out);
        }
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<AgentEvent>) {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return;
        };
        if let Some(event) = self.map_event(&value) {
            out.push(event);
        }
    }

    fn map_event(&mut self, value: &Value) -> Option<AgentEvent> {
        let ty = value.get("type")?.as_str()?;
        let timestamp = self.clock.tick();
        let make = |kind: AgentEventKind, message: String, data: Option<BTreeMap<String, Value>>| {
            let mut event = AgentEvent::new(kind, self.agent.clone(), message);
            if let Some(data) = data {
                event = event.with_data(data);
            }
            event.with_timestamp(timestamp)
        };

        match ty {
            "agent_start" => Some(make(AgentEventKind::Started, "agent started".to_string(), None)),
            "content" => {
                let payload = value
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(make(AgentEventKind::Chunk, payload, None))
            }
            "tool_call" => {
                let name = value
                    .get("data")
                    .and_then(|d| d.get("name"))
                    .and_then(Value::as_str)
                    .or_else(|| value.get("tool").and_then(Value::as_str))
                    .unwrap_or("tool")
                    .to_string();
                let mut data = BTreeMap::new();
                data.insert("tool".to_string(), Value::String(name.clone()));
                Some(make(AgentEventKind::ToolUse, format!("using tool: {name}"), Some(data)))
            }
            "tool_result" => Some(make(AgentEventKind::Progress, "tool result".to_string(), None)),
            "agent_end" => Some(make(AgentEventKind::Completed, "agent completed".to_string(), None)),
            "progress" | "result" => Some(make(AgentEventKind::Progress, "progress".to_string(), None)),
            _ => None,
        }
    }
}

impl StreamParser for JsonLineStreamParser {
    fn parse_chunk(&mut self, bytes: &[u8]) -> Vec<AgentEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        self.drain_complete_lines(&mut out);
        out
    }

    fn finish(&mut self) -> StreamFinish {
        if self.buffer.is_empty() {
            return StreamFinish::default();
        }
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            self.buffer.clear();
            return StreamFinish::default();
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            self.buffer.clear();
            let event = self.map_event(&value);
            return StreamFinish {
                events: event.into_iter().collect(),
                incomplete_tail: None,
            };
        }
        let tail = text.clone();
        self.buffer.clear();
        StreamFinish {
            events: Vec::new(),
            incomplete_tail: Some(tail),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.clock = TimestampClock::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        let lines = [
            r#"{"type":"agent_start"}"#,
            r#"{"type":"content","data":"hello"}"#,
            r#"{"type":"content","data":" world"}"#,
            r#"{"type":"tool_call","data":{"name":"grep"}}"#,
            r#"{"type":"tool_result"}"#,
            r#"{"type":"content","data":"done"}"#,
            r#"{"type":"agent_end"}"#,
        ];
        let mut bytes = Vec::new();
        for line in lines {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        bytes
    }

    #[test]
    fn whole_stream_produces_seven_events_in_order() {
        let mut parser = JsonLineStreamParser::new("claude");
        let events = parser.parse_chunk(&payload());
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AgentEventKind::Started,
                AgentEventKind::Chunk,
                AgentEventKind::Chunk,
                AgentEventKind::ToolUse,
                AgentEventKind::Progress,
                AgentEventKind::Chunk,
                AgentEventKind::Completed,
            ]
        );
    }

    #[test]
    fn one_byte_chunks_yield_the_same_seven_events() {
        let data = payload();
        let mut parser = JsonLineStreamParser::new("claude");
        let mut events = Vec::new();
        for byte in &data {
            events.extend(parser.parse_chunk(std::slice::from_ref(byte)));
        }
        events.extend(parser.finish().events);
        assert_eq!(events.len(), 7);
        assert_eq!(events[0].kind, AgentEventKind::Started);
        assert_eq!(events[6].kind, AgentEventKind::Completed);
    }

    #[test]
    fn malformed_lines_are_silently_skipped() {
        let mut parser = JsonLineStreamParser::new("claude");
        let events = parser.parse_chunk(b"not json\n{\"type\":\"agent_start\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AgentEventKind::Started);
    }

    #[test]
    fn trailing_bytes_without_newline_are_flushed_on_finish() {
        let mut parser = JsonLineStreamParser::new("claude");
        let events = parser.parse_chunk(br#"{"type":"agent_end"}"#);
        assert!(events.is_empty());
        let finish = parser.finish();
        assert_eq!(finish.events.len(), 1);
        assert_eq!(finish.events[0].kind, AgentEventKind::Completed);
        assert!(finish.incomplete_tail.is_none());
    }

    #[test]
    fn unparseable_trailing_bytes_are_reported_incomplete_not_error() {
        let mut parser = JsonLineStreamParser::new("claude");
        let _ = parser.parse_chunk(br#"{"type":"agent_end""#);
        let finish = parser.finish();
        assert!(finish.events.is_empty());
        assert!(finish.incomplete_tail.is_some());
    }

    #[test]
    fn arbitrary_chunk_partitions_are_equivalent() {
        let data = payload();
        let whole_events = {
            let mut parser = JsonLineStreamParser::new("claude");
            let mut events = parser.parse_chunk(&data);
            events.extend(parser.finish().events);
            events
        };

        for split_sizes in [vec![3, 5, 7, 11], vec![1; data.len()], vec![data.len()]] {
            let mut parser = JsonLineStreamParser::new("claude");
            let mut events = Vec::new();
            let mut offset = 0;
            for size in split_sizes.iter().cycle() {
                if offset >= data.len() {
                    break;
                }
                let end = (offset + size).min(data.len());
                events.extend(parser.parse_chunk(&data[offset..end]));
                offset = end;
            }
            events.extend(parser.finish().events);
            let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
            let whole_kinds: Vec<_> = whole_events.iter().map(|e| e.kind).collect();
            assert_eq!(kinds, whole_kinds);
        }
    }
}
