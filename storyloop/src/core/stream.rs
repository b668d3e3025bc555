//! Incremental decoding of the agent's newline-delimited JSON event stream.
//!
//! Output arrives in arbitrary chunks while the agent runs. [`LineDecoder`]
//! frames complete lines with a bounded carry-over buffer, and
//! [`decode_line`] turns each line into zero or more [`StreamEvent`]s.
//! Anything that does not look like a known record is dropped.

use serde_json::Value;
use tracing::debug;

/// One meaningful record from the agent stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Assistant text fragment, in arrival order.
    Text(String),
    /// A tool invocation started.
    ToolStart { name: String },
    /// A tool invocation finished.
    ToolEnd,
}

/// Splits a byte stream into lines without waiting for end of stream.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl LineDecoder {
    /// `limit` bounds the bytes kept for a single unterminated line.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit: limit.max(1),
            discarding: false,
        }
    }

    /// Feed a chunk and return every line it completed (without the newline).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for segment in chunk.split_inclusive(|b| *b == b'\n') {
            let terminated = segment.last() == Some(&b'\n');
            let body = if terminated {
                &segment[..segment.len() - 1]
            } else {
                segment
            };

            if !self.discarding {
                if self.buf.len() + body.len() > self.limit {
                    debug!(
                        kept = self.buf.len(),
                        limit = self.limit,
                        "dropping oversized stream line"
                    );
                    self.buf.clear();
                    self.discarding = true;
                } else {
                    self.buf.extend_from_slice(body);
                }
            }

            if terminated {
                if !self.discarding {
                    lines.push(take_line(&mut self.buf));
                }
                self.buf.clear();
                self.discarding = false;
            }
        }
        lines
    }

    /// Flush a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.discarding || self.buf.is_empty() {
            self.buf.clear();
            self.discarding = false;
            return None;
        }
        Some(take_line(&mut self.buf))
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf).trim_end_matches('\r').to_string();
    buf.clear();
    line
}

/// Decode one stream line. Malformed or unrecognized input yields no events.
pub fn decode_line(line: &str) -> Vec<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(record) = serde_json::from_str::<Value>(trimmed) else {
        return Vec::new();
    };

    let kind = record.get("type").and_then(Value::as_str);
    let Some(content) = record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in content {
        let block_kind = block.get("type").and_then(Value::as_str);
        match (kind, block_kind) {
            (Some("assistant"), Some("text")) => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events.push(StreamEvent::Text(text.to_string()));
                }
            }
            (Some("assistant"), Some("tool_use")) => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                events.push(StreamEvent::ToolStart { name });
            }
            (Some("user"), Some("tool_result")) => events.push(StreamEvent::ToolEnd),
            _ => {}
        }
    }
    events
}

/// Short human label for a tool name; unknown tools keep their raw name.
pub fn tool_label(name: &str) -> String {
    let label = match name {
        "Read" => "Reading file",
        "Write" => "Writing file",
        "Edit" | "MultiEdit" => "Editing file",
        "NotebookEdit" => "Editing notebook",
        "Bash" => "Running command",
        "Grep" => "Searching code",
        "Glob" => "Finding files",
        "WebFetch" => "Fetching web page",
        "WebSearch" => "Searching the web",
        "Task" => "Delegating to subagent",
        "TodoWrite" => "Updating todo list",
        other => return other.to_string(),
    };
    label.to_string()
}
