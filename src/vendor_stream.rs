//! Vendor stream payloads mapped onto the `{"type": ..., "data": ...}` event shape.
//!
//! Each vendor line becomes zero or more platform events, so the decoder keeps a
//! single reducer for content, reasoning, tool calls and errors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Payload dialect of a chat stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    #[default]
    Platform,
    /// `chat.completion.chunk` objects, terminated by `[DONE]`.
    OpenAi,
    /// Messages API events, terminated by `message_stop`.
    Anthropic,
    /// NDJSON objects, terminated by `"done": true`.
    Ollama,
}

pub(crate) enum Step {
    Event(Value),
    Done,
}

pub(crate) fn translate(format: StreamFormat, value: Value) -> Vec<Step> {
    match format {
        StreamFormat::Platform => vec![Step::Event(value)],
        StreamFormat::OpenAi => openai(&value),
        StreamFormat::Anthropic => anthropic(&value),
        StreamFormat::Ollama => ollama(&value),
    }
}

fn openai(value: &Value) -> Vec<Step> {
    if let Some(err) = value.get("error") {
        return vec![error(err)];
    }
    let delta = &value["choices"][0]["delta"];
    let mut steps = Vec::new();
    let reasoning = non_empty(delta, "reasoning_content").or_else(|| non_empty(delta, "reasoning"));
    if let Some(text) = reasoning {
        steps.push(event("reasoning", json!(text)));
    }
    if let Some(text) = non_empty(delta, "content") {
        steps.push(event("chunk", json!(text)));
    }
    steps
}

fn anthropic(value: &Value) -> Vec<Step> {
    match value["type"].as_str() {
        Some("content_block_delta") => {
            let delta = &value["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => text_step(delta, "text", "chunk"),
                Some("thinking_delta") => text_step(delta, "thinking", "reasoning"),
                _ => Vec::new(),
            }
        }
        Some("content_block_start") if value["content_block"]["type"] == "tool_use" => {
            let block = &value["content_block"];
            vec![event(
                "mcp_tool_call",
                json!({ "id": block["id"], "name": block["name"], "arguments": block["input"] }),
            )]
        }
        Some("message_stop") => vec![Step::Done],
        Some("error") => vec![error(&value["error"])],
        _ => Vec::new(),
    }
}

fn ollama(value: &Value) -> Vec<Step> {
    if let Some(err) = value.get("error") {
        return vec![error(err)];
    }
    let message = &value["message"];
    let mut steps = text_step(message, "thinking", "reasoning");
    steps.extend(text_step(message, "content", "chunk"));
    for call in message["tool_calls"].as_array().into_iter().flatten() {
        let function = &call["function"];
        let data = json!({
            "id": call["id"],
            "name": function["name"],
            "arguments": function["arguments"]
        });
        steps.push(event("mcp_tool_call", data));
    }
    if value["done"].as_bool() == Some(true) {
        steps.push(Step::Done);
    }
    steps
}

fn event(kind: &str, data: Value) -> Step {
    Step::Event(json!({ "type": kind, "data": data }))
}

fn text_step(value: &Value, field: &str, kind: &str) -> Vec<Step> {
    non_empty(value, field)
        .map(|text| vec![event(kind, json!(text))])
        .unwrap_or_default()
}

fn non_empty<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value[field].as_str().filter(|text| !text.is_empty())
}

fn error(err: &Value) -> Step {
    let message = err
        .as_str()
        .or_else(|| err["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    Step::Event(json!({ "type": "error", "message": message }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(format: StreamFormat, value: Value) -> Vec<Value> {
        translate(format, value)
            .into_iter()
            .map(|step| match step {
                Step::Event(value) => value,
                Step::Done => json!("done"),
            })
            .collect()
    }

    #[test]
    fn openai_deltas_become_chunks() {
        let out = events(
            StreamFormat::OpenAi,
            json!({"choices":[{"delta":{"reasoning_content":"hm","content":"Hi"}}]}),
        );
        assert_eq!(
            out,
            vec![
                json!({"type":"reasoning","data":"hm"}),
                json!({"type":"chunk","data":"Hi"}),
            ]
        );
        let role_only = events(
            StreamFormat::OpenAi,
            json!({"choices":[{"delta":{"role":"assistant","content":""}}]}),
        );
        assert!(role_only.is_empty());
    }

    #[test]
    fn anthropic_events_map_to_chunks_tools_and_done() {
        let text = events(
            StreamFormat::Anthropic,
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "Hi" }
            }),
        );
        assert_eq!(text, vec![json!({"type":"chunk","data":"Hi"})]);

        let tool = events(
            StreamFormat::Anthropic,
            json!({
                "type": "content_block_start",
                "content_block": {
                    "type": "tool_use",
                    "id": "tu_1",
                    "name": "search",
                    "input": {}
                }
            }),
        );
        assert_eq!(tool[0]["type"], "mcp_tool_call");
        assert_eq!(tool[0]["data"]["id"], "tu_1");

        let stop = events(StreamFormat::Anthropic, json!({"type":"message_stop"}));
        assert_eq!(stop, vec![json!("done")]);

        let err = events(
            StreamFormat::Anthropic,
            json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}),
        );
        assert_eq!(err, vec![json!({"type":"error","message":"Overloaded"})]);
    }

    #[test]
    fn ollama_final_object_completes() {
        let out = events(
            StreamFormat::Ollama,
            json!({"message":{"role":"assistant","content":"!"},"done":true}),
        );
        assert_eq!(out, vec![json!({"type":"chunk","data":"!"}), json!("done")]);
        let err = events(StreamFormat::Ollama, json!({"error":"model not found"}));
        assert_eq!(err, vec![json!({"type":"error","message":"model not found"})]);
    }

    #[test]
    fn platform_payloads_pass_through() {
        let value = json!({"type":"chunk","data":"x"});
        assert_eq!(events(StreamFormat::Platform, value.clone()), vec![value]);
    }
}
