//! Incremental decoder for the line-oriented chat stream.
//!
//! Wire format, one event per line (blank lines tolerated):
//!
//! ```text
//! data: {"type":"chunk","data":"Hel"}
//! data: {"type":"reasoning","data":"thinking..."}
//! data: {"type":"mcp_tool_call","data":{"id":"t1","name":"search","arguments":{}}}
//! data: {"type":"error","message":"quota exceeded"}
//! data: [DONE]
//! ```
//!
//! Fragments may split a line (or a UTF-8 sequence) anywhere. A line is only
//! processed once its terminating newline has arrived, so decoding a payload in
//! one piece or one byte at a time yields the same events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cancel::CancelHandle,
    transport::Fragment,
    vendor_stream::{translate, Step, StreamFormat},
};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const TOOL_EVENT_PREFIX: &str = "mcp_tool_";

/// Non-content payload kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Reasoning,
    Context,
    References,
    Suggestions,
    ConversationId,
    Annotations,
}

impl MetadataKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "reasoning" => Some(MetadataKind::Reasoning),
            "context" => Some(MetadataKind::Context),
            "references" => Some(MetadataKind::References),
            "suggestions" => Some(MetadataKind::Suggestions),
            "conversation_id" => Some(MetadataKind::ConversationId),
            "annotations" => Some(MetadataKind::Annotations),
            _ => None,
        }
    }
}

/// Sub-phase of a tool invocation, taken from the event type's suffix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Call,
    Result,
    Error,
}

impl ToolPhase {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "call" => Some(ToolPhase::Call),
            "result" => Some(ToolPhase::Result),
            "error" => Some(ToolPhase::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Completed,
    Failed,
}

/// Lifecycle of one external tool invocation (`call → result` or `call → error`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Running message state assembled from a stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssembledMessage {
    /// Append-only concatenation of every content delta.
    pub content: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
    #[serde(default)]
    pub annotations: Vec<Value>,
}

/// Typed event produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ContentDelta {
        delta: String,
        running_content: String,
    },
    Metadata {
        kind: MetadataKind,
        payload: Value,
    },
    ToolCall {
        phase: ToolPhase,
        id: String,
        payload: Value,
    },
    Error {
        message: String,
    },
    Done {
        message: AssembledMessage,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done { .. })
    }
}

/// Synchronous reducer from fragments to [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Text after the last newline seen so far.
    buffer: String,
    message: AssembledMessage,
    tool_index: HashMap<String, usize>,
    terminal: bool,
    cancel: Option<CancelHandle>,
    format: StreamFormat,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop emitting as soon as `cancel` is triggered, even mid-fragment.
    pub fn with_cancel(cancel: CancelHandle) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }

    /// Decode vendor payloads of `format` instead of platform events.
    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// True once a sentinel, an error payload or a cancellation ended the stream.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }

    pub fn message(&self) -> &AssembledMessage {
        &self.message
    }

    pub fn into_message(self) -> AssembledMessage {
        self.message
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled)
    }

    /// Consume one fragment, emitting an event for every complete line it finishes.
    pub fn feed<F>(&mut self, fragment: impl Into<Fragment>, mut emit: F)
    where
        F: FnMut(StreamEvent),
    {
        if self.terminal {
            return;
        }
        match fragment.into() {
            Fragment::Bytes(bytes) => self.decode_bytes(&bytes),
            Fragment::Text(text) => {
                self.flush_pending_lossy();
                self.buffer.push_str(&text);
            }
        }
        while let Some(idx) = self.buffer.find('\n') {
            if self.is_cancelled() {
                self.stop();
                return;
            }
            let line: String = self.buffer.drain(..=idx).collect();
            self.process_line(&line, &mut emit);
            if self.terminal {
                self.buffer.clear();
                return;
            }
        }
    }

    /// Collecting variant of [`StreamDecoder::feed`].
    pub fn feed_collect(&mut self, fragment: impl Into<Fragment>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.feed(fragment, |event| events.push(event));
        events
    }

    /// End of input: treat whatever is buffered as a final line.
    pub fn finish<F>(&mut self, mut emit: F)
    where
        F: FnMut(StreamEvent),
    {
        if self.terminal {
            return;
        }
        self.flush_pending_lossy();
        if self.is_cancelled() {
            self.stop();
            return;
        }
        let line = std::mem::take(&mut self.buffer);
        self.process_line(&line, &mut emit);
    }

    fn stop(&mut self) {
        self.terminal = true;
        self.buffer.clear();
        self.pending.clear();
    }

    fn decode_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let data = std::mem::take(&mut self.pending);
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn flush_pending_lossy(&mut self) {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&pending));
        }
    }

    fn process_line<F>(&mut self, raw: &str, emit: &mut F)
    where
        F: FnMut(StreamEvent),
    {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        let payload = if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            rest.trim()
        } else if line == DONE_SENTINEL || line.starts_with('{') {
            line
        } else {
            // Other SSE fields (`event:`, `id:`, `retry:`, `:` comments).
            return;
        };
        if payload == DONE_SENTINEL {
            self.complete(emit);
            return;
        }
        if payload.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => {
                for step in translate(self.format, value) {
                    match step {
                        Step::Event(event) => self.dispatch(event, emit),
                        Step::Done => self.complete(emit),
                    }
                    if self.terminal {
                        break;
                    }
                }
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(error = %_err, "skipping malformed stream line");
            }
        }
    }

    fn complete<F>(&mut self, emit: &mut F)
    where
        F: FnMut(StreamEvent),
    {
        self.terminal = true;
        emit(StreamEvent::Done {
            message: self.message.clone(),
        });
    }

    fn dispatch<F>(&mut self, value: Value, emit: &mut F)
    where
        F: FnMut(StreamEvent),
    {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return;
        };
        match kind {
            "error" => {
                self.terminal = true;
                emit(StreamEvent::Error {
                    message: error_message(&value),
                });
            }
            "chunk" => {
                let delta = value
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.message.content.push_str(&delta);
                emit(StreamEvent::ContentDelta {
                    delta,
                    running_content: self.message.content.clone(),
                });
            }
            tool if tool.starts_with(TOOL_EVENT_PREFIX) => {
                let Some(phase) = ToolPhase::from_suffix(&tool[TOOL_EVENT_PREFIX.len()..]) else {
                    return;
                };
                let payload = payload_of(&value);
                let id = self.update_tool(phase, &payload);
                emit(StreamEvent::ToolCall { phase, id, payload });
            }
            other => {
                // Unrecognized types are forward-compatible no-ops.
                let Some(kind) = MetadataKind::from_type(other) else {
                    return;
                };
                let payload = payload_of(&value);
                self.record_metadata(kind, &payload);
                emit(StreamEvent::Metadata { kind, payload });
            }
        }
    }

    fn record_metadata(&mut self, kind: MetadataKind, payload: &Value) {
        match kind {
            MetadataKind::Reasoning => {
                if let Some(text) = payload.as_str() {
                    self.message.reasoning.push_str(text);
                }
            }
            MetadataKind::ConversationId => {
                let id = payload
                    .as_str()
                    .or_else(|| payload.get("conversation_id").and_then(Value::as_str));
                if let Some(id) = id {
                    self.message.conversation_id = Some(id.to_string());
                }
            }
            MetadataKind::Context => self.message.context = Some(payload.clone()),
            MetadataKind::References => self.message.references = Some(payload.clone()),
            MetadataKind::Suggestions => self.message.suggestions = Some(payload.clone()),
            MetadataKind::Annotations => self.message.annotations.push(payload.clone()),
        }
    }

    fn update_tool(&mut self, phase: ToolPhase, payload: &Value) -> String {
        let id = string_field(payload, &["id", "tool_call_id", "call_id"])
            .or_else(|| match phase {
                ToolPhase::Call => None,
                // Results without an id settle the most recent pending call.
                ToolPhase::Result | ToolPhase::Error => self
                    .message
                    .tool_calls
                    .iter()
                    .rev()
                    .find(|t| t.status == ToolStatus::Pending)
                    .map(|t| t.id.clone()),
            })
            .unwrap_or_else(|| format!("tool_{}", self.message.tool_calls.len()));

        let idx = match self.tool_index.get(&id) {
            Some(idx) => *idx,
            None => {
                self.message.tool_calls.push(ToolCallState {
                    id: id.clone(),
                    name: None,
                    arguments: None,
                    status: ToolStatus::Pending,
                    result: None,
                    error: None,
                });
                let idx = self.message.tool_calls.len() - 1;
                self.tool_index.insert(id.clone(), idx);
                idx
            }
        };
        let state = &mut self.message.tool_calls[idx];
        if let Some(name) = string_field(payload, &["name", "tool_name"]) {
            state.name = Some(name);
        }
        match phase {
            ToolPhase::Call => {
                if let Some(args) = first_field(payload, &["arguments", "args", "input"]) {
                    state.arguments = Some(args.clone());
                }
                state.status = ToolStatus::Pending;
            }
            ToolPhase::Result => {
                state.result = Some(
                    first_field(payload, &["result", "content", "output"])
                        .cloned()
                        .unwrap_or_else(|| payload.clone()),
                );
                state.status = ToolStatus::Completed;
            }
            ToolPhase::Error => {
                state.error = Some(error_message(payload));
                state.status = ToolStatus::Failed;
            }
        }
        id
    }
}

/// `data` when present, otherwise the event object itself.
fn payload_of(value: &Value) -> Value {
    value.get("data").cloned().unwrap_or_else(|| value.clone())
}

fn first_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| value.get(*key).filter(|v| !v.is_null()))
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn error_message(value: &Value) -> String {
    let nested = value.get("data");
    string_field(value, &["message", "error"])
        .or_else(|| nested.and_then(|d| string_field(d, &["message", "error"])))
        .or_else(|| nested.and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "stream error".to_string())
}
