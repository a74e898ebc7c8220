//! Protocol switch stage: Anthropic ↔ OpenAI dialect translation.
//!
//! Converts request bodies to the upstream's dialect on the way down and
//! responses (buffered or streamed) back to the virtual model's declared
//! client dialect on the way up. Tool definitions and tool calls translate in
//! both directions. The conversion is the identity on the mappable field
//! subset: model, message text, tool calls, stop reason, and token usage.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::payload::{Dialect, FrameStream, Payload, Reply, SseFrame};
use crate::stage::Stage;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Translates between protocol dialects at the top of the stage chain.
#[derive(Debug, Clone)]
pub struct ProtocolSwitchStage {
    name: String,
    /// Dialect the virtual model presents to clients.
    client: Dialect,
    /// Dialect the upstream provider speaks.
    upstream: Dialect,
}

impl ProtocolSwitchStage {
    pub fn new(name: impl Into<String>, client: Dialect, upstream: Dialect) -> Self {
        Self {
            name: name.into(),
            client,
            upstream,
        }
    }
}

#[async_trait]
impl Stage for ProtocolSwitchStage {
    fn kind(&self) -> &'static str {
        "protocol-switch"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _ctx: &ExecutionContext, payload: Payload) -> Result<Payload> {
        if payload.dialect == self.upstream || self.upstream == Dialect::Unknown {
            return Ok(payload);
        }
        let body = match (payload.dialect, self.upstream) {
            (Dialect::OpenAi, Dialect::Anthropic) => openai_to_anthropic_request(&payload.body),
            (Dialect::Anthropic, Dialect::OpenAi) => anthropic_to_openai_request(&payload.body),
            _ => payload.body.clone(),
        };
        Ok(Payload {
            dialect: self.upstream,
            body,
            stream: payload.stream,
        })
    }

    async fn process_response(&self, _ctx: &ExecutionContext, reply: Reply) -> Result<Reply> {
        if self.client == self.upstream || self.client == Dialect::Unknown {
            return Ok(reply);
        }
        match (self.upstream, self.client, reply) {
            (Dialect::Anthropic, Dialect::OpenAi, Reply::Complete(body)) => {
                Ok(Reply::Complete(anthropic_to_openai_response(&body)))
            }
            (Dialect::OpenAi, Dialect::Anthropic, Reply::Complete(body)) => {
                Ok(Reply::Complete(openai_to_anthropic_response(&body)))
            }
            (Dialect::Anthropic, Dialect::OpenAi, Reply::Stream(frames)) => {
                Ok(Reply::Stream(anthropic_stream_to_openai(frames)))
            }
            (Dialect::OpenAi, Dialect::Anthropic, Reply::Stream(frames)) => {
                Ok(Reply::Stream(openai_stream_to_anthropic(frames)))
            }
            (_, _, reply) => Ok(reply),
        }
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map an Anthropic stop reason to an OpenAI finish reason.
fn stop_reason_to_finish_reason(stop: &str) -> &'static str {
    match stop {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Map an OpenAI finish reason to an Anthropic stop reason.
fn finish_reason_to_stop_reason(finish: &str) -> &'static str {
    match finish {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

// ---- request conversion ----

/// Convert an OpenAI chat-completions request to the Anthropic messages shape.
pub fn openai_to_anthropic_request(body: &Value) -> Value {
    let mut out = Map::new();

    if let Some(model) = body.get("model") {
        out.insert("model".into(), model.clone());
    }
    // Anthropic requires max_tokens; OpenAI leaves it optional.
    let max_tokens = body
        .get("max_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(1024);
    out.insert("max_tokens".into(), json!(max_tokens));
    for key in ["temperature", "top_p", "stream", "stop"] {
        if let Some(v) = body.get(key) {
            let target = if key == "stop" { "stop_sequences" } else { key };
            out.insert(target.into(), v.clone());
        }
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in body
        .get("messages")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        match role {
            "system" => {
                if let Some(text) = msg.get("content").and_then(|v| v.as_str()) {
                    system_parts.push(text.to_string());
                }
            }
            "tool" => {
                // Tool results become user-role tool_result blocks.
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "content": msg.get("content").cloned().unwrap_or(Value::Null),
                });
                messages.push(json!({ "role": "user", "content": [block] }));
            }
            "assistant" => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(text) = msg.get("content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                }
                for call in msg
                    .get("tool_calls")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                {
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    let arguments = function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str::<Value>(s).ok())
                        .unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.get("id").cloned().unwrap_or(Value::Null),
                        "name": function.get("name").cloned().unwrap_or(Value::Null),
                        "input": arguments,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            _ => {
                messages.push(json!({
                    "role": "user",
                    "content": msg.get("content").cloned().unwrap_or(Value::Null),
                }));
            }
        }
    }

    if !system_parts.is_empty() {
        out.insert("system".into(), json!(system_parts.join("\n")));
    }
    out.insert("messages".into(), Value::Array(messages));

    if let Some(tools) = body.get("tools").and_then(|v| v.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .filter_map(|t| t.get("function"))
            .map(|f| {
                json!({
                    "name": f.get("name").cloned().unwrap_or(Value::Null),
                    "description": f.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": f.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        out.insert("tools".into(), Value::Array(converted));
    }

    Value::Object(out)
}

/// Convert an Anthropic messages request to the OpenAI chat-completions shape.
pub fn anthropic_to_openai_request(body: &Value) -> Value {
    let mut out = Map::new();

    if let Some(model) = body.get("model") {
        out.insert("model".into(), model.clone());
    }
    for key in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(v) = body.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(v) = body.get("stop_sequences") {
        out.insert("stop".into(), v.clone());
    }

    let mut messages: Vec<Value> = Vec::new();

    match body.get("system") {
        Some(Value::String(text)) => {
            messages.push(json!({ "role": "system", "content": text }));
        }
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                .collect();
            if !text.is_empty() {
                messages.push(json!({ "role": "system", "content": text.join("\n") }));
            }
        }
        _ => {}
    }

    for msg in body
        .get("messages")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        match msg.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({ "role": role, "content": text }));
            }
            Some(Value::Array(blocks)) => {
                let mut text_parts: Vec<String> = Vec::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(|v| v.as_str()) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let arguments = block
                                .get("input")
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "{}".to_string());
                            tool_calls.push(json!({
                                "id": block.get("id").cloned().unwrap_or(Value::Null),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                                    "arguments": arguments,
                                },
                            }));
                        }
                        Some("tool_result") => {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                                "content": block.get("content").cloned().unwrap_or(Value::Null),
                            }));
                        }
                        _ => {}
                    }
                }
                if !text_parts.is_empty() || !tool_calls.is_empty() {
                    let mut m = Map::new();
                    m.insert("role".into(), json!(role));
                    m.insert("content".into(), json!(text_parts.join("")));
                    if !tool_calls.is_empty() {
                        m.insert("tool_calls".into(), Value::Array(tool_calls));
                    }
                    messages.push(Value::Object(m));
                }
            }
            _ => {}
        }
    }

    out.insert("messages".into(), Value::Array(messages));

    if let Some(tools) = body.get("tools").and_then(|v| v.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.get("name").cloned().unwrap_or(Value::Null),
                        "description": t.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": t.get("input_schema").cloned().unwrap_or(json!({})),
                    },
                })
            })
            .collect();
        out.insert("tools".into(), Value::Array(converted));
    }

    Value::Object(out)
}

// ---- response conversion ----

/// Convert an Anthropic messages response to the OpenAI completion shape.
pub fn anthropic_to_openai_response(body: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in body
        .get("content")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let arguments = block
                    .get("input")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    },
                }));
            }
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("end_turn");

    let mut message = Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert("content".into(), json!(text));
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(tool_calls));
    }

    json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "created": now_epoch_secs(),
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": stop_reason_to_finish_reason(stop_reason),
        }],
        "usage": {
            "prompt_tokens": body.pointer("/usage/input_tokens").cloned().unwrap_or(json!(0)),
            "completion_tokens": body.pointer("/usage/output_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

/// Convert an OpenAI completion response to the Anthropic messages shape.
pub fn openai_to_anthropic_response(body: &Value) -> Value {
    let choice = body
        .pointer("/choices/0")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));

    let mut blocks: Vec<Value> = Vec::new();
    if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            blocks.push(json!({ "type": "text", "text": text }));
        }
    }
    for call in message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        let input = function
            .get("arguments")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .unwrap_or(json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": function.get("name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }

    let finish = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop");

    json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "type": "message",
        "role": "assistant",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "content": blocks,
        "stop_reason": finish_reason_to_stop_reason(finish),
        "usage": {
            "input_tokens": body.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": body.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

// ---- stream conversion ----

/// Convert one Anthropic stream frame into zero or more OpenAI chunk frames.
pub fn anthropic_frame_to_openai(frame: &SseFrame) -> Vec<SseFrame> {
    let Some(event) = frame.parse_json() else {
        return Vec::new();
    };
    match event.get("type").and_then(|v| v.as_str()) {
        Some("message_start") => {
            let chunk = json!({
                "object": "chat.completion.chunk",
                "choices": [{ "index": 0, "delta": { "role": "assistant" } }],
            });
            vec![SseFrame::data(chunk.to_string())]
        }
        Some("content_block_delta") => {
            let text = event
                .pointer("/delta/text")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if text.is_empty() {
                return Vec::new();
            }
            let chunk = json!({
                "object": "chat.completion.chunk",
                "choices": [{ "index": 0, "delta": { "content": text } }],
            });
            vec![SseFrame::data(chunk.to_string())]
        }
        Some("message_delta") => {
            let stop = event
                .pointer("/delta/stop_reason")
                .and_then(|v| v.as_str())
                .unwrap_or("end_turn");
            let chunk = json!({
                "object": "chat.completion.chunk",
                "choices": [{
                    "index": 0,
                    "delta": {},
                    "finish_reason": stop_reason_to_finish_reason(stop),
                }],
            });
            vec![SseFrame::data(chunk.to_string())]
        }
        Some("message_stop") => vec![SseFrame::done()],
        // ping, content_block_start, content_block_stop carry no client data
        _ => Vec::new(),
    }
}

/// Convert one OpenAI chunk frame into zero or more Anthropic stream frames.
/// `started` tracks whether the message scaffolding has been emitted yet.
pub fn openai_frame_to_anthropic(frame: &SseFrame, started: &mut bool) -> Vec<SseFrame> {
    if frame.is_done() {
        let mut out = Vec::new();
        out.push(SseFrame::event(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": 0 }).to_string(),
        ));
        out.push(SseFrame::event(
            "message_stop",
            json!({ "type": "message_stop" }).to_string(),
        ));
        return out;
    }
    let Some(chunk) = frame.parse_json() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    if !*started {
        *started = true;
        out.push(SseFrame::event(
            "message_start",
            json!({
                "type": "message_start",
                "message": { "role": "assistant", "content": [] },
            })
            .to_string(),
        ));
        out.push(SseFrame::event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" },
            })
            .to_string(),
        ));
    }

    if let Some(text) = chunk.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            out.push(SseFrame::event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": text },
                })
                .to_string(),
            ));
        }
    }
    if let Some(finish) = chunk
        .pointer("/choices/0/finish_reason")
        .and_then(|v| v.as_str())
    {
        out.push(SseFrame::event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": finish_reason_to_stop_reason(finish) },
            })
            .to_string(),
        ));
    }
    out
}

fn anthropic_stream_to_openai(frames: FrameStream) -> FrameStream {
    Box::pin(frames.flat_map(|item| {
        let out: Vec<Result<SseFrame>> = match item {
            Ok(frame) => anthropic_frame_to_openai(&frame).into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        };
        futures::stream::iter(out)
    }))
}

fn openai_stream_to_anthropic(frames: FrameStream) -> FrameStream {
    let mut started = false;
    Box::pin(frames.flat_map(move |item| {
        let out: Vec<Result<SseFrame>> = match item {
            Ok(frame) => openai_frame_to_anthropic(&frame, &mut started)
                .into_iter()
                .map(Ok)
                .collect(),
            Err(err) => vec![Err(err)],
        };
        futures::stream::iter(out)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_request() -> Value {
        json!({
            "model": "claude-3-sonnet",
            "max_tokens": 512,
            "temperature": 0.3,
            "messages": [
                { "role": "system", "content": "Be terse." },
                { "role": "user", "content": "hi" },
            ],
        })
    }

    #[test]
    fn test_openai_to_anthropic_request_basics() {
        let out = openai_to_anthropic_request(&openai_request());
        assert_eq!(out["model"], "claude-3-sonnet");
        assert_eq!(out["max_tokens"], 512);
        assert_eq!(out["system"], "Be terse.");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_openai_to_anthropic_defaults_max_tokens() {
        let out = openai_to_anthropic_request(&json!({
            "model": "m", "messages": [{ "role": "user", "content": "x" }]
        }));
        assert_eq!(out["max_tokens"], 1024);
    }

    #[test]
    fn test_tool_definition_translation() {
        let body = json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "weather?" }],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Look up weather",
                    "parameters": { "type": "object", "properties": { "city": { "type": "string" } } },
                },
            }],
        });
        let anthropic = openai_to_anthropic_request(&body);
        assert_eq!(anthropic["tools"][0]["name"], "get_weather");
        assert!(anthropic["tools"][0]["input_schema"]["properties"]["city"].is_object());

        let back = anthropic_to_openai_request(&anthropic);
        assert_eq!(back["tools"][0]["function"]["name"], "get_weather");
    }

    #[test]
    fn test_tool_call_and_result_translation() {
        let body = json!({
            "model": "m",
            "messages": [
                { "role": "user", "content": "weather in Oslo" },
                { "role": "assistant", "content": "", "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}" },
                }]},
                { "role": "tool", "tool_call_id": "call_1", "content": "4C, rain" },
            ],
        });
        let anthropic = openai_to_anthropic_request(&body);
        let messages = anthropic["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["city"], "Oslo");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn test_anthropic_response_to_openai() {
        let body = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-sonnet",
            "content": [{ "type": "text", "text": "hello there" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 3 },
        });
        let out = anthropic_to_openai_response(&body);
        assert_eq!(out["choices"][0]["message"]["content"], "hello there");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["prompt_tokens"], 10);
        assert_eq!(out["usage"]["completion_tokens"], 3);
    }

    #[test]
    fn test_response_roundtrip_on_mappable_subset() {
        // Mappable subset: id, model, text content, stop reason, usage.
        let original = json!({
            "id": "msg_rt",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-haiku",
            "content": [{ "type": "text", "text": "round trip" }],
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 7, "output_tokens": 2 },
        });
        let there = anthropic_to_openai_response(&original);
        let back = openai_to_anthropic_response(&there);
        assert_eq!(back["id"], original["id"]);
        assert_eq!(back["model"], original["model"]);
        assert_eq!(back["content"], original["content"]);
        assert_eq!(back["stop_reason"], original["stop_reason"]);
        assert_eq!(back["usage"], original["usage"]);
    }

    #[test]
    fn test_tool_use_response_translation() {
        let body = json!({
            "id": "msg_2",
            "model": "claude-3-sonnet",
            "content": [
                { "type": "text", "text": "Checking." },
                { "type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": { "city": "Oslo" } },
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 1, "output_tokens": 1 },
        });
        let out = anthropic_to_openai_response(&body);
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        let call = &out["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "get_weather");
        let args: Value = serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["city"], "Oslo");
    }

    #[test]
    fn test_anthropic_frames_to_openai_chunks() {
        let frames = [
            SseFrame::event("message_start", json!({"type": "message_start"}).to_string()),
            SseFrame::event(
                "content_block_delta",
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}).to_string(),
            ),
            SseFrame::event(
                "content_block_delta",
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "lo"}}).to_string(),
            ),
            SseFrame::event("message_stop", json!({"type": "message_stop"}).to_string()),
        ];

        let mut content = String::new();
        let mut saw_done = false;
        for frame in &frames {
            for out in anthropic_frame_to_openai(frame) {
                if out.is_done() {
                    saw_done = true;
                    continue;
                }
                if let Some(text) = out
                    .parse_json()
                    .as_ref()
                    .and_then(|v| v.pointer("/choices/0/delta/content"))
                    .and_then(|v| v.as_str())
                {
                    content.push_str(text);
                }
            }
        }
        assert_eq!(content, "Hello");
        assert!(saw_done);
    }

    #[test]
    fn test_openai_chunks_to_anthropic_frames() {
        let frames = [
            SseFrame::data(
                json!({"choices": [{"index": 0, "delta": {"content": "Hi"}}]}).to_string(),
            ),
            SseFrame::data(
                json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}).to_string(),
            ),
            SseFrame::done(),
        ];

        let mut started = false;
        let mut events: Vec<String> = Vec::new();
        for frame in &frames {
            for out in openai_frame_to_anthropic(frame, &mut started) {
                events.push(out.event.clone().unwrap_or_default());
            }
        }
        assert_eq!(
            events,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "message_delta",
                "content_block_stop",
                "message_stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_converts_request_down() {
        let stage = ProtocolSwitchStage::new("proto", Dialect::OpenAi, Dialect::Anthropic);
        let ctx = ExecutionContext::builder("vm").build();
        let payload = Payload::openai(openai_request());
        let out = stage.process(&ctx, payload).await.unwrap();
        assert_eq!(out.dialect, Dialect::Anthropic);
        assert_eq!(out.body["system"], "Be terse.");
    }

    #[tokio::test]
    async fn test_stage_passthrough_when_dialects_match() {
        let stage = ProtocolSwitchStage::new("proto", Dialect::OpenAi, Dialect::OpenAi);
        let ctx = ExecutionContext::builder("vm").build();
        let reply = stage
            .process_response(&ctx, Reply::Complete(json!({"choices": []})))
            .await
            .unwrap();
        let body = reply.into_complete().unwrap();
        assert!(body.get("choices").is_some());
    }
}
