//! Event sink for scheduler lifecycle hooks.
//!
//! An optional, non-intrusive way to observe executions. The scheduler emits
//! events as requests start, retry, fail over, and finish; components never
//! reach up to a message bus — they publish through this injected sink.
//! Implement [`EventHandler`] for logging, progress tracking, or metrics
//! export.

use crate::error::ErrorCode;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted during request execution and pool management.
#[derive(Debug, Clone)]
pub enum Event {
    /// An execution has entered the scheduler.
    ExecutionStart {
        execution_id: String,
        virtual_model: String,
    },
    /// An attempt is being dispatched to an instance.
    Attempt {
        execution_id: String,
        instance_id: String,
        attempt: u32,
    },
    /// A recovery action decided a retry or failover.
    Retry {
        execution_id: String,
        attempt: u32,
        delay: Duration,
        code: ErrorCode,
    },
    /// An instance was blacklisted.
    Blacklisted {
        instance_id: String,
        code: ErrorCode,
        permanent: bool,
    },
    /// An execution has left the scheduler.
    ExecutionEnd {
        execution_id: String,
        instance_id: Option<String>,
        ok: bool,
        retries: u32,
        elapsed: Duration,
    },
}

/// Handler for scheduler lifecycle events.
///
/// Entirely optional — the scheduler works without one.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
