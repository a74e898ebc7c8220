//! Per-request execution context.
//!
//! [`ExecutionContext`] carries the stable execution id, the monotonic
//! deadline governing the whole `execute` call, the retry counter, and the
//! cancellation flag. One context is built per logical request and lives
//! across every retry of it; the scheduler mutates `retry_count` and
//! `instance_id` between attempts.

use crate::error::{ErrorCode, PipelineError, Result};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::Instant;

/// Request-scoped scratch flags shared by the stages of one execution.
///
/// Stages are shared across concurrent requests and hold no per-request
/// state of their own; anything a down-path stage must communicate to its
/// up-path half travels here. One cell per logical request, carried across
/// retries.
#[derive(Debug, Default)]
pub struct RequestFlags {
    /// Whether the client asked for a streaming response. Set by the
    /// workflow stage on the way down, read on the way back up.
    pub client_stream: AtomicBool,
    /// Whether a token refresh has already been attempted for this request.
    pub token_refreshed: AtomicBool,
}

/// Shared state for one logical request across all of its attempts.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Stable across retries; returned to the client as `X-Execution-Id`.
    pub execution_id: String,
    pub virtual_model: String,
    /// Instance serving the current attempt; set by the scheduler.
    pub instance_id: Option<String>,
    pub started_at: Instant,
    /// Overall deadline: `started_at + timeout`.
    pub deadline: Instant,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, String>,
    pub cancellation: Option<Arc<AtomicBool>>,
    pub flags: Arc<RequestFlags>,
}

impl ExecutionContext {
    pub fn builder(virtual_model: impl Into<String>) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            virtual_model: virtual_model.into(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
            metadata: HashMap::new(),
            cancellation: None,
        }
    }

    /// Time left before the overall deadline. Zero once passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Budget for the next attempt: `min(remaining, timeout / (max_retries + 1))`.
    pub fn attempt_budget(&self) -> Duration {
        let per_attempt = self.timeout / (self.max_retries + 1);
        self.remaining().min(per_attempt)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(
                PipelineError::new(ErrorCode::EXECUTION_CANCELLED, "execution cancelled")
                    .with_virtual_model(&self.virtual_model),
            );
        }
        Ok(())
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Debug)]
pub struct ExecutionContextBuilder {
    virtual_model: String,
    timeout: Duration,
    max_retries: u32,
    metadata: HashMap<String, String>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl ExecutionContextBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(cancel);
        self
    }

    pub fn build(self) -> ExecutionContext {
        let started_at = Instant::now();
        ExecutionContext {
            execution_id: uuid::Uuid::new_v4().to_string(),
            virtual_model: self.virtual_model,
            instance_id: None,
            started_at,
            deadline: started_at + self.timeout,
            timeout: self.timeout,
            retry_count: 0,
            max_retries: self.max_retries,
            metadata: self.metadata,
            cancellation: self.cancellation,
            flags: Arc::new(RequestFlags::default()),
        }
    }
}
