//! Tagged payloads flowing through pipeline stages.
//!
//! The request body is inherently opaque to the gateway, so it travels as a
//! `serde_json::Value` tagged with the protocol [`Dialect`] it is shaped in.
//! Stages transform the tagged value and return a new one rather than
//! mutating in place. On the way back up, a [`Reply`] is either a complete
//! JSON response or a stream of SSE frames.

use crate::error::{ErrorCode, PipelineError, Result};
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;

/// Protocol dialect a payload is shaped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// OpenAI chat-completions shape (`/v1/chat/completions`).
    OpenAi,
    /// Anthropic messages shape (`/v1/messages`).
    Anthropic,
    /// Unrecognized shape, passed through untouched.
    Unknown,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
            Dialect::Unknown => "unknown",
        }
    }

    /// Infer the dialect from the request path the front-end accepted.
    pub fn from_path(path: &str) -> Dialect {
        if path.ends_with("/chat/completions") {
            Dialect::OpenAi
        } else if path.ends_with("/messages") {
            Dialect::Anthropic
        } else {
            Dialect::Unknown
        }
    }
}

/// A request payload on its way down the stage chain.
#[derive(Debug, Clone)]
pub struct Payload {
    pub dialect: Dialect,
    pub body: Value,
    /// Whether the client asked for a streaming response.
    pub stream: bool,
}

impl Payload {
    pub fn new(dialect: Dialect, body: Value) -> Self {
        let stream = body
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Self {
            dialect,
            body,
            stream,
        }
    }

    pub fn openai(body: Value) -> Self {
        Self::new(Dialect::OpenAi, body)
    }

    pub fn anthropic(body: Value) -> Self {
        Self::new(Dialect::Anthropic, body)
    }

    /// The `model` field of the body, if present.
    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(|v| v.as_str())
    }

    /// Overwrite the `model` field (used when a virtual model resolves to a
    /// concrete upstream model id).
    pub fn set_model(&mut self, model: &str) {
        if let Some(obj) = self.body.as_object_mut() {
            obj.insert("model".into(), Value::String(model.to_string()));
        }
    }
}

/// One server-sent event on the wire: optional event name plus a data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// A plain `data:` frame.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// A named-event frame (`event: <name>` followed by `data:`).
    pub fn event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The OpenAI stream terminator frame.
    pub fn done() -> Self {
        Self::data("[DONE]")
    }

    /// Terminal `event: error` frame for failures after the first byte of a
    /// stream has been sent.
    pub fn terminal_error(error: &PipelineError) -> Self {
        Self::event(
            "error",
            serde_json::json!({
                "error": {
                    "code": error.code.0,
                    "message": error.message,
                    "category": error.category().as_str(),
                }
            })
            .to_string(),
        )
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Parse the data line as JSON, if it is JSON.
    pub fn parse_json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }

    /// Encode to wire text, trailing blank line included.
    pub fn to_wire(&self) -> String {
        match &self.event {
            Some(event) => format!("event: {}\ndata: {}\n\n", event, self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// A boxed stream of SSE frames; errors mid-stream become terminal
/// `event: error` frames at the front-end.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// A response on its way back up the stage chain.
pub enum Reply {
    /// A complete JSON response body.
    Complete(Value),
    /// An in-flight SSE frame stream.
    Stream(FrameStream),
}

impl Reply {
    pub fn is_stream(&self) -> bool {
        matches!(self, Reply::Stream(_))
    }

    /// Unwrap a complete body; a stream here is a stage-ordering bug.
    pub fn into_complete(self) -> Result<Value> {
        match self {
            Reply::Complete(body) => Ok(body),
            Reply::Stream(_) => Err(PipelineError::new(
                ErrorCode::INTERNAL_ERROR,
                "expected a buffered reply but got a stream",
            )),
        }
    }

    /// Wrap an already-materialized frame sequence as a stream.
    pub fn from_frames(frames: Vec<SseFrame>) -> Self {
        let iter = frames.into_iter().map(Ok);
        Reply::Stream(Box::pin(futures::stream::iter(iter)))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Complete(body) => f.debug_tuple("Complete").field(body).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
