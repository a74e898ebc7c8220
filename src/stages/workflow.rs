//! Workflow stage: bidirectional streaming ↔ non-streaming adaptation.
//!
//! On the way down, reconciles what the client asked for (`stream: true`)
//! with what the upstream exchange will actually do. On the way back up,
//! `streamify` chunks a buffered response into SSE frames for clients that
//! asked to stream, and `destreamify` collects a frame stream into a
//! buffered response for clients that did not. Frames are produced in the
//! upstream's dialect; the protocol switch above converts them if needed.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::payload::{Dialect, Payload, Reply, SseFrame};
use crate::stage::Stage;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

/// Size of each synthetic content delta emitted by `streamify`.
const STREAMIFY_CHUNK_CHARS: usize = 32;

/// Adapts streaming mode between client and upstream.
#[derive(Debug, Clone)]
pub struct WorkflowStage {
    name: String,
    /// Dialect the frames below this stage are shaped in.
    dialect: Dialect,
    /// Whether the upstream exchange streams.
    upstream_streaming: bool,
}

impl WorkflowStage {
    pub fn new(name: impl Into<String>, dialect: Dialect, upstream_streaming: bool) -> Self {
        Self {
            name: name.into(),
            dialect,
            upstream_streaming,
        }
    }
}

#[async_trait]
impl Stage for WorkflowStage {
    fn kind(&self) -> &'static str {
        "workflow"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &ExecutionContext, mut payload: Payload) -> Result<Payload> {
        ctx.flags
            .client_stream
            .store(payload.stream, Ordering::Relaxed);

        if payload.stream != self.upstream_streaming {
            if let Some(obj) = payload.body.as_object_mut() {
                obj.insert("stream".into(), json!(self.upstream_streaming));
            }
            payload.stream = self.upstream_streaming;
        }
        Ok(payload)
    }

    async fn process_response(&self, ctx: &ExecutionContext, reply: Reply) -> Result<Reply> {
        let client_wants_stream = ctx.flags.client_stream.load(Ordering::Relaxed);
        match (client_wants_stream, reply) {
            (true, Reply::Complete(body)) => Ok(Reply::from_frames(streamify(&body, self.dialect))),
            (false, Reply::Stream(frames)) => {
                let body = destreamify(frames, self.dialect).await?;
                Ok(Reply::Complete(body))
            }
            (_, reply) => Ok(reply),
        }
    }
}

fn split_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if current.len() >= STREAMIFY_CHUNK_CHARS {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Chunk a buffered response into SSE frames whose concatenated deltas equal
/// the original content.
pub fn streamify(body: &Value, dialect: Dialect) -> Vec<SseFrame> {
    match dialect {
        Dialect::Anthropic => streamify_anthropic(body),
        _ => streamify_openai(body),
    }
}

fn streamify_openai(body: &Value) -> Vec<SseFrame> {
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let model = body.get("model").cloned().unwrap_or(Value::Null);
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let finish = body
        .pointer("/choices/0/finish_reason")
        .cloned()
        .unwrap_or(json!("stop"));

    let chunk = |delta: Value, finish_reason: Value| {
        SseFrame::data(
            json!({
                "id": id.clone(),
                "object": "chat.completion.chunk",
                "model": model.clone(),
                "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
            })
            .to_string(),
        )
    };

    let mut frames = vec![chunk(json!({ "role": "assistant" }), Value::Null)];
    for piece in split_chunks(content) {
        frames.push(chunk(json!({ "content": piece }), Value::Null));
    }
    frames.push(chunk(json!({}), finish));
    frames.push(SseFrame::done());
    frames
}

fn streamify_anthropic(body: &Value) -> Vec<SseFrame> {
    let text: String = body
        .get("content")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
        .collect();
    let stop_reason = body.get("stop_reason").cloned().unwrap_or(json!("end_turn"));

    let mut frames = vec![
        SseFrame::event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": body.get("id").cloned().unwrap_or(Value::Null),
                    "role": "assistant",
                    "model": body.get("model").cloned().unwrap_or(Value::Null),
                    "content": [],
                },
            })
            .to_string(),
        ),
        SseFrame::event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" },
            })
            .to_string(),
        ),
    ];
    for piece in split_chunks(&text) {
        frames.push(SseFrame::event(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": piece },
            })
            .to_string(),
        ));
    }
    frames.push(SseFrame::event(
        "content_block_stop",
        json!({ "type": "content_block_stop", "index": 0 }).to_string(),
    ));
    frames.push(SseFrame::event(
        "message_delta",
        json!({ "type": "message_delta", "delta": { "stop_reason": stop_reason } }).to_string(),
    ));
    frames.push(SseFrame::event(
        "message_stop",
        json!({ "type": "message_stop" }).to_string(),
    ));
    frames
}

/// Collect a frame stream into a buffered response body.
pub async fn destreamify(mut frames: crate::payload::FrameStream, dialect: Dialect) -> Result<Value> {
    let mut collected = Vec::new();
    while let Some(frame) = frames.next().await {
        collected.push(frame?);
    }
    Ok(match dialect {
        Dialect::Anthropic => destreamify_anthropic(&collected),
        _ => destreamify_openai(&collected),
    })
}

fn destreamify_openai(frames: &[SseFrame]) -> Value {
    let mut id = Value::Null;
    let mut model = Value::Null;
    let mut content = String::new();
    let mut finish = json!("stop");

    for frame in frames {
        if frame.is_done() {
            continue;
        }
        let Some(chunk) = frame.parse_json() else {
            continue;
        };
        if id.is_null() {
            if let Some(v) = chunk.get("id") {
                id = v.clone();
            }
        }
        if model.is_null() {
            if let Some(v) = chunk.get("model") {
                model = v.clone();
            }
        }
        if let Some(text) = chunk.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
            content.push_str(text);
        }
        if let Some(v) = chunk.pointer("/choices/0/finish_reason") {
            if !v.is_null() {
                finish = v.clone();
            }
        }
    }

    json!({
        "id": id,
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish,
        }],
    })
}

fn destreamify_anthropic(frames: &[SseFrame]) -> Value {
    let mut id = Value::Null;
    let mut model = Value::Null;
    let mut text = String::new();
    let mut stop_reason = json!("end_turn");

    for frame in frames {
        let Some(event) = frame.parse_json() else {
            continue;
        };
        match event.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                if let Some(v) = event.pointer("/message/id") {
                    id = v.clone();
                }
                if let Some(v) = event.pointer("/message/model") {
                    model = v.clone();
                }
            }
            Some("content_block_delta") => {
                if let Some(t) = event.pointer("/delta/text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
            Some("message_delta") => {
                if let Some(v) = event.pointer("/delta/stop_reason") {
                    stop_reason = v.clone();
                }
            }
            _ => {}
        }
    }

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": text }],
        "stop_reason": stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_response(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop",
            }],
        })
    }

    #[test]
    fn test_streamify_concatenation_equals_content() {
        let content = "The quick brown fox jumps over the lazy dog, twice over.";
        let frames = streamify(&openai_response(content), Dialect::OpenAi);

        let mut rebuilt = String::new();
        for frame in &frames {
            if frame.is_done() {
                continue;
            }
            if let Some(text) = frame
                .parse_json()
                .as_ref()
                .and_then(|v| v.pointer("/choices/0/delta/content"))
                .and_then(|v| v.as_str())
            {
                rebuilt.push_str(text);
            }
        }
        assert_eq!(rebuilt, content);
        assert!(frames.last().unwrap().is_done());
    }

    #[test]
    fn test_streamify_anthropic_event_order() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3-haiku",
            "content": [{ "type": "text", "text": "short" }],
            "stop_reason": "end_turn",
        });
        let frames = streamify(&body, Dialect::Anthropic);
        let events: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(
            events,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_destreamify_streamify_roundtrip() {
        let content = "Streaming adaptation must be lossless for text content.";
        let frames = streamify(&openai_response(content), Dialect::OpenAi);
        let reply = Reply::from_frames(frames);
        let Reply::Stream(stream) = reply else {
            panic!("expected stream");
        };
        let body = destreamify(stream, Dialect::OpenAi).await.unwrap();
        assert_eq!(
            body.pointer("/choices/0/message/content").and_then(|v| v.as_str()),
            Some(content)
        );
        assert_eq!(body["id"], "chatcmpl-1");
    }

    #[tokio::test]
    async fn test_destreamify_anthropic() {
        let body = json!({
            "id": "msg_9",
            "model": "claude-3-haiku",
            "content": [{ "type": "text", "text": "collected text output" }],
            "stop_reason": "max_tokens",
        });
        let frames = streamify(&body, Dialect::Anthropic);
        let Reply::Stream(stream) = Reply::from_frames(frames) else {
            panic!("expected stream");
        };
        let rebuilt = destreamify(stream, Dialect::Anthropic).await.unwrap();
        assert_eq!(rebuilt["content"][0]["text"], "collected text output");
        assert_eq!(rebuilt["stop_reason"], "max_tokens");
    }

    #[tokio::test]
    async fn test_stage_records_client_intent_and_rewrites_flag() {
        let stage = WorkflowStage::new("wf", Dialect::OpenAi, false);
        let ctx = ExecutionContext::builder("vm").build();
        let payload = Payload::openai(json!({ "model": "m", "stream": true }));

        let out = stage.process(&ctx, payload).await.unwrap();
        assert!(!out.stream);
        assert_eq!(out.body["stream"], false);
        assert!(ctx.flags.client_stream.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stage_streamifies_buffered_reply_for_streaming_client() {
        let stage = WorkflowStage::new("wf", Dialect::OpenAi, false);
        let ctx = ExecutionContext::builder("vm").build();
        ctx.flags.client_stream.store(true, Ordering::Relaxed);

        let reply = stage
            .process_response(&ctx, Reply::Complete(openai_response("hi")))
            .await
            .unwrap();
        assert!(reply.is_stream());
    }

    #[tokio::test]
    async fn test_stage_collects_stream_for_buffered_client() {
        let stage = WorkflowStage::new("wf", Dialect::OpenAi, true);
        let ctx = ExecutionContext::builder("vm").build();
        ctx.flags.client_stream.store(false, Ordering::Relaxed);

        let frames = streamify(&openai_response("buffered"), Dialect::OpenAi);
        let reply = stage
            .process_response(&ctx, Reply::from_frames(frames))
            .await
            .unwrap();
        let body = reply.into_complete().unwrap();
        assert_eq!(
            body.pointer("/choices/0/message/content").and_then(|v| v.as_str()),
            Some("buffered")
        );
    }
}
