//! Stage trait and stage chains.
//!
//! A stage is one transform layer in a pipeline: a down-path
//! (`process`) applied to the request and an up-path (`process_response`)
//! applied to the reply in reverse order. Four kinds are composed per
//! instance: protocol switch, workflow (stream adaptation), compatibility
//! (field mapping), and provider I/O. Order is fixed by the assembly
//! template, not per request.
//!
//! # Object Safety
//!
//! The trait is object-safe and used as `Arc<dyn Stage>` so assembled
//! chains can mix kinds without generic constraints.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::payload::{Payload, Reply};
use async_trait::async_trait;

impl std::fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// One transform layer in a pipeline instance.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable kind identifier (e.g. `"protocol-switch"`, `"provider"`).
    fn kind(&self) -> &'static str;

    /// Instance name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Open long-lived resources (HTTP client, token cache). Called once,
    /// in declared order, before the instance becomes Ready.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Transform the request on the way down. The terminal (provider) stage
    /// performs the upstream exchange instead and returns the first [`Reply`]
    /// via [`Stage::call`].
    async fn process(&self, ctx: &ExecutionContext, payload: Payload) -> Result<Payload>;

    /// Transform the reply on the way back up (reverse declared order).
    async fn process_response(&self, ctx: &ExecutionContext, reply: Reply) -> Result<Reply>;

    /// Whether this stage terminates the down-path with an upstream exchange.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Perform the upstream exchange. Only meaningful for terminal stages;
    /// the default is a contract violation surfaced as an internal error.
    async fn call(&self, _ctx: &ExecutionContext, _payload: Payload) -> Result<Reply> {
        Err(crate::error::PipelineError::new(
            crate::error::ErrorCode::INTERNAL_ERROR,
            format!("stage '{}' is not a terminal stage", self.name()),
        ))
    }

    /// Rotate to the next credential. Terminal stages holding a credential
    /// list return the new index and whether the rotation wrapped past the
    /// last credential; `None` when nothing is rotatable.
    fn rotate_credential(&self) -> Option<(usize, bool)> {
        None
    }

    /// Refresh expired auth material (OAuth refresh grant). No-op by default.
    async fn refresh_auth(&self) -> Result<()> {
        Ok(())
    }

    /// Stage-specific health probe (token validity, reachability).
    async fn health_probe(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources. Called in reverse declared order during destroy.
    async fn teardown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Dialect;
    use serde_json::json;

    struct Passthrough;

    #[async_trait]
    impl Stage for Passthrough {
        fn kind(&self) -> &'static str {
            "passthrough"
        }

        fn name(&self) -> &str {
            "pass"
        }

        async fn process(&self, _ctx: &ExecutionContext, payload: Payload) -> Result<Payload> {
            Ok(payload)
        }

        async fn process_response(&self, _ctx: &ExecutionContext, reply: Reply) -> Result<Reply> {
            Ok(reply)
        }
    }

    #[tokio::test]
    async fn test_default_call_rejects_non_terminal() {
        let stage = Passthrough;
        let ctx = ExecutionContext::builder("vm").build();
        let payload = Payload::new(Dialect::OpenAi, json!({}));
        let err = stage.call(&ctx, payload).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::INTERNAL_ERROR);
        assert!(!stage.is_terminal());
    }

    #[tokio::test]
    async fn test_default_lifecycle_hooks() {
        let stage = Passthrough;
        assert!(stage.initialize().await.is_ok());
        assert!(stage.health_probe().await.is_ok());
        stage.teardown().await;
    }
}
