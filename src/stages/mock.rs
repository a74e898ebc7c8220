//! Scripted provider stage for testing without a live upstream.
//!
//! [`MockProviderStage`] plays back a script of outcomes in order, cycling
//! when exhausted, so scheduler and instance behavior can be tested
//! deterministically: canned replies, canned frame streams, HTTP failures
//! with `Retry-After`, and artificial latency for timeout scenarios.

use crate::context::ExecutionContext;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::payload::{Payload, Reply, SseFrame};
use crate::stage::Stage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What one scripted call produces.
#[derive(Debug, Clone)]
pub enum MockResult {
    /// A buffered reply body.
    Reply(Value),
    /// A streamed reply.
    Frames(Vec<SseFrame>),
    /// An upstream HTTP error classified through the taxonomy.
    HttpError {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    /// A pre-classified failure.
    Error(ErrorCode, String),
}

/// One script entry: optional latency, then a result.
#[derive(Debug, Clone)]
pub struct MockOutcome {
    pub delay: Option<Duration>,
    pub result: MockResult,
}

impl MockOutcome {
    pub fn reply(body: Value) -> Self {
        Self {
            delay: None,
            result: MockResult::Reply(body),
        }
    }

    pub fn frames(frames: Vec<SseFrame>) -> Self {
        Self {
            delay: None,
            result: MockResult::Frames(frames),
        }
    }

    pub fn http_error(status: u16) -> Self {
        Self {
            delay: None,
            result: MockResult::HttpError {
                status,
                body: String::new(),
                retry_after: None,
            },
        }
    }

    pub fn http_error_with_retry_after(status: u16, retry_after: Duration) -> Self {
        Self {
            delay: None,
            result: MockResult::HttpError {
                status,
                body: String::new(),
                retry_after: Some(retry_after),
            },
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            delay: None,
            result: MockResult::Error(code, message.into()),
        }
    }

    /// Add artificial latency before the result.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A terminal stage that plays back scripted outcomes.
///
/// Cycles from the beginning when the script is exhausted. Tracks call
/// count and credential rotation so tests can assert on both.
#[derive(Debug)]
pub struct MockProviderStage {
    name: String,
    script: Vec<MockOutcome>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
    credential_count: usize,
    credential_index: AtomicUsize,
}

impl MockProviderStage {
    pub fn new(name: impl Into<String>, script: Vec<MockOutcome>) -> Self {
        assert!(!script.is_empty(), "mock script requires at least one outcome");
        Self {
            name: name.into(),
            script,
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            credential_count: 1,
            credential_index: AtomicUsize::new(0),
        }
    }

    /// A mock that always returns the same buffered reply.
    pub fn fixed(name: impl Into<String>, body: Value) -> Self {
        Self::new(name, vec![MockOutcome::reply(body)])
    }

    pub fn with_credentials(mut self, count: usize) -> Self {
        self.credential_count = count.max(1);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn credential_index(&self) -> usize {
        self.credential_index.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> MockOutcome {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.script.len();
        self.script[idx].clone()
    }
}

#[async_trait]
impl Stage for MockProviderStage {
    fn kind(&self) -> &'static str {
        "mock-provider"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn rotate_credential(&self) -> Option<(usize, bool)> {
        let previous = self.credential_index.load(Ordering::Relaxed);
        let next = (previous + 1) % self.credential_count;
        self.credential_index.store(next, Ordering::Relaxed);
        Some((next, next == 0))
    }

    async fn process(&self, _ctx: &ExecutionContext, payload: Payload) -> Result<Payload> {
        Ok(payload)
    }

    async fn process_response(&self, _ctx: &ExecutionContext, reply: Reply) -> Result<Reply> {
        Ok(reply)
    }

    async fn call(&self, ctx: &ExecutionContext, _payload: Payload) -> Result<Reply> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let outcome = self.next_outcome();
        if let Some(delay) = outcome.delay {
            tokio::time::sleep(delay).await;
        }
        ctx.check_cancelled()?;
        match outcome.result {
            MockResult::Reply(body) => Ok(Reply::Complete(body)),
            MockResult::Frames(frames) => Ok(Reply::from_frames(frames)),
            MockResult::HttpError {
                status,
                body,
                retry_after,
            } => Err(PipelineError::from_http_status(status, body, retry_after)),
            MockResult::Error(code, message) => Err(PipelineError::new(code, message)),
        }
    }
}
