//! Pipeline instance: one assembled stage chain bound to one target.
//!
//! An instance owns its stages and its metrics. Lifecycle: Creating →
//! Initializing → Ready, Running per-request, Error on fatal stage failure,
//! Maintenance by explicit action or error-center decision, and Destroying →
//! Destroyed releasing stage resources in reverse order. Destroyed is
//! terminal. Only Ready and Running instances accept work.

use crate::context::ExecutionContext;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::metrics::{HealthStatus, InstanceMetrics, MetricsSnapshot, CONSECUTIVE_ERROR_THRESHOLD};
use crate::payload::{Payload, Reply};
use crate::stage::Stage;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// One concrete upstream: provider, model, and which credential to use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub provider_id: String,
    pub model_id: String,
    pub credential_index: usize,
}

/// Instance lifecycle state. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Initializing,
    Ready,
    Running,
    Paused,
    Error,
    Maintenance,
    Destroying,
    Destroyed,
}

impl InstanceState {
    /// Whether new work may be dispatched in this state.
    pub fn accepts_work(self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Destroyed)
    }

    /// Transition legality. Destroyed is absorbing.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        match (self, to) {
            (Destroyed, _) => false,
            (_, Destroying) => true,
            (Destroying, Destroyed) => true,
            (Creating, Initializing) => true,
            (Initializing, Ready | Error) => true,
            (Ready, Running | Paused | Maintenance | Error) => true,
            (Running, Ready | Maintenance | Error) => true,
            (Paused, Ready) => true,
            (Error, Initializing | Maintenance) => true,
            (Maintenance, Ready) => true,
            _ => false,
        }
    }
}

/// A runtime pipeline: ordered stages bound to one target.
pub struct PipelineInstance {
    id: String,
    virtual_model: String,
    target: Target,
    stages: Vec<Arc<dyn Stage>>,
    state: RwLock<InstanceState>,
    enabled: AtomicBool,
    in_maintenance: AtomicBool,
    weight: u32,
    max_concurrent: usize,
    metrics: InstanceMetrics,
}

impl std::fmt::Debug for PipelineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineInstance")
            .field("id", &self.id)
            .field("virtual_model", &self.virtual_model)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("stages", &self.stages.iter().map(|s| s.kind()).collect::<Vec<_>>())
            .finish()
    }
}

impl PipelineInstance {
    pub fn new(
        id: impl Into<String>,
        virtual_model: impl Into<String>,
        target: Target,
        stages: Vec<Arc<dyn Stage>>,
        weight: u32,
        max_concurrent: usize,
    ) -> Self {
        Self {
            id: id.into(),
            virtual_model: virtual_model.into(),
            target,
            stages,
            state: RwLock::new(InstanceState::Creating),
            enabled: AtomicBool::new(true),
            in_maintenance: AtomicBool::new(false),
            weight: weight.max(1),
            max_concurrent: max_concurrent.max(1),
            metrics: InstanceMetrics::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn virtual_model(&self) -> &str {
        &self.virtual_model
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn metrics(&self) -> &InstanceMetrics {
        &self.metrics
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn in_maintenance(&self) -> bool {
        self.in_maintenance.load(Ordering::Relaxed)
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        self.in_maintenance.store(maintenance, Ordering::Relaxed);
        let mut state = self.state.write();
        if maintenance && state.can_transition_to(InstanceState::Maintenance) {
            *state = InstanceState::Maintenance;
        } else if !maintenance && *state == InstanceState::Maintenance {
            *state = InstanceState::Ready;
        }
    }

    fn transition(&self, to: InstanceState) -> Result<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(to) {
            return Err(PipelineError::new(
                ErrorCode::LIFECYCLE_VIOLATION,
                format!("illegal transition {:?} -> {:?}", *state, to),
            )
            .with_instance(self.id.clone()));
        }
        *state = to;
        Ok(())
    }

    /// Wire the stage chain: every stage initializes in declared order.
    /// Any failure moves the instance to Error and surfaces as 2002.
    pub async fn initialize(&self) -> Result<()> {
        self.transition(InstanceState::Initializing)?;

        if let Err(err) = self.validate_chain() {
            *self.state.write() = InstanceState::Error;
            return Err(err);
        }
        for stage in &self.stages {
            if let Err(err) = stage.initialize().await {
                *self.state.write() = InstanceState::Error;
                return Err(PipelineError::new(
                    ErrorCode::PIPELINE_INIT_FAILED,
                    format!("stage '{}' failed to initialize: {}", stage.name(), err),
                )
                .with_instance(self.id.clone())
                .with_virtual_model(self.virtual_model.clone()));
            }
        }

        self.transition(InstanceState::Ready)?;
        tracing::info!(instance = %self.id, virtual_model = %self.virtual_model, "pipeline instance ready");
        Ok(())
    }

    fn validate_chain(&self) -> Result<()> {
        let terminal_count = self.stages.iter().filter(|s| s.is_terminal()).count();
        let last_is_terminal = self.stages.last().is_some_and(|s| s.is_terminal());
        if terminal_count != 1 || !last_is_terminal {
            return Err(PipelineError::new(
                ErrorCode::PIPELINE_INIT_FAILED,
                "stage chain requires exactly one terminal stage, in last position",
            )
            .with_instance(self.id.clone()));
        }
        Ok(())
    }

    /// Eligibility for selection, blacklist excluded (the scheduler checks
    /// the registry separately).
    pub fn is_eligible(&self) -> bool {
        self.is_enabled()
            && !self.in_maintenance()
            && self.state().accepts_work()
            && self.metrics.active_requests() < self.max_concurrent
    }

    /// Run the stage chain: `process` down in declared order, the terminal
    /// stage's exchange, then `process_response` up in reverse order.
    pub async fn execute(&self, ctx: &ExecutionContext, payload: Payload) -> Result<Reply> {
        if !self.state().accepts_work() {
            return Err(PipelineError::new(
                ErrorCode::LIFECYCLE_VIOLATION,
                format!("instance in state {:?} cannot accept work", self.state()),
            )
            .with_instance(self.id.clone()));
        }
        if self.metrics.active_requests() >= self.max_concurrent {
            // Saturation is a skip signal for the scheduler, not a failure.
            return Err(PipelineError::new(
                ErrorCode::PIPELINE_SATURATED,
                format!("instance '{}' is at max concurrency", self.id),
            )
            .with_instance(self.id.clone()));
        }

        self.metrics.begin_request();
        {
            let mut state = self.state.write();
            if *state == InstanceState::Ready {
                *state = InstanceState::Running;
            }
        }
        // The guard releases the slot even when the scheduler's per-attempt
        // timeout drops this future mid-flight.
        let _guard = ActiveGuard { instance: self };

        let started = Instant::now();
        let result = self.run_chain(ctx, payload).await;

        match &result {
            Ok(_) => self.metrics.record_success(started.elapsed()),
            Err(_) => self.metrics.record_failure(),
        }

        result.map_err(|e| {
            e.with_instance(self.id.clone())
                .with_virtual_model(self.virtual_model.clone())
        })
    }

    async fn run_chain(&self, ctx: &ExecutionContext, mut payload: Payload) -> Result<Reply> {
        let mut reply: Option<Reply> = None;
        for stage in &self.stages {
            ctx.check_cancelled()?;
            if stage.is_terminal() {
                reply = Some(stage.call(ctx, payload).await?);
                break;
            }
            payload = stage.process(ctx, payload).await?;
        }
        let mut reply = reply.ok_or_else(|| {
            PipelineError::new(ErrorCode::INTERNAL_ERROR, "stage chain has no terminal stage")
        })?;

        for stage in self.stages.iter().rev() {
            reply = stage.process_response(ctx, reply).await?;
        }
        Ok(reply)
    }

    /// Rotate the terminal stage's credential. Returns the new index and
    /// whether the rotation wrapped (every credential tried).
    pub fn rotate_credential(&self) -> Option<(usize, bool)> {
        self.stages
            .iter()
            .find(|s| s.is_terminal())
            .and_then(|s| s.rotate_credential())
    }

    /// Current credential index at the terminal stage, when rotatable.
    pub fn credential_index(&self) -> usize {
        self.target.credential_index
    }

    pub async fn refresh_auth(&self) -> Result<()> {
        for stage in &self.stages {
            if stage.is_terminal() {
                return stage.refresh_auth().await;
            }
        }
        Ok(())
    }

    /// Run stage probes; fall back to the consecutive-error threshold.
    pub async fn perform_health_check(&self, volume_threshold: u64) -> HealthStatus {
        for stage in &self.stages {
            if stage.health_probe().await.is_err() {
                return HealthStatus::Unhealthy;
            }
        }
        if self.metrics.consecutive_errors() >= CONSECUTIVE_ERROR_THRESHOLD {
            return HealthStatus::Unhealthy;
        }
        self.metrics.health(volume_threshold)
    }

    /// Tear down the stage chain in reverse order. Irreversible.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.write();
            if state.is_terminal() || *state == InstanceState::Destroying {
                return;
            }
            *state = InstanceState::Destroying;
        }
        for stage in self.stages.iter().rev() {
            stage.teardown().await;
        }
        *self.state.write() = InstanceState::Destroyed;
        tracing::info!(instance = %self.id, "pipeline instance destroyed");
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.id.clone(),
            virtual_model: self.virtual_model.clone(),
            target: self.target.clone(),
            state: self.state(),
            health: self.metrics.health(1),
            enabled: self.is_enabled(),
            in_maintenance: self.in_maintenance(),
            weight: self.weight,
            metrics: self.metrics.snapshot(),
        }
    }
}

struct ActiveGuard<'a> {
    instance: &'a PipelineInstance,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.instance.metrics.end_request();
        if self.instance.metrics.active_requests() == 0 {
            let mut state = self.instance.state.write();
            if *state == InstanceState::Running {
                *state = InstanceState::Ready;
            }
        }
    }
}

/// Point-in-time status of one instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    pub virtual_model: String,
    pub target: Target,
    pub state: InstanceState,
    pub health: HealthStatus,
    pub enabled: bool,
    pub in_maintenance: bool,
    pub weight: u32,
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Dialect;
    use crate::stages::{MockOutcome, MockProviderStage};
    use serde_json::json;

    fn target() -> Target {
        Target {
            provider_id: "openai".into(),
            model_id: "gpt-4o".into(),
            credential_index: 0,
        }
    }

    fn mock_instance(script: Vec<MockOutcome>) -> PipelineInstance {
        PipelineInstance::new(
            "inst-1",
            "gpt-4o-vm",
            target(),
            vec![Arc::new(MockProviderStage::new("mock", script))],
            1,
            4,
        )
    }

    fn payload() -> Payload {
        Payload::new(Dialect::OpenAi, json!({ "model": "gpt-4o-vm" }))
    }

    #[tokio::test]
    async fn test_lifecycle_creating_to_ready() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({}))]);
        assert_eq!(instance.state(), InstanceState::Creating);
        instance.initialize().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_lifecycle_violation() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({}))]);
        instance.initialize().await.unwrap();
        let err = instance.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LIFECYCLE_VIOLATION);
    }

    #[tokio::test]
    async fn test_chain_without_terminal_fails_init() {
        struct NoOp;
        #[async_trait::async_trait]
        impl Stage for NoOp {
            fn kind(&self) -> &'static str {
                "noop"
            }
            fn name(&self) -> &str {
                "noop"
            }
            async fn process(&self, _: &ExecutionContext, p: Payload) -> Result<Payload> {
                Ok(p)
            }
            async fn process_response(&self, _: &ExecutionContext, r: Reply) -> Result<Reply> {
                Ok(r)
            }
        }

        let instance = PipelineInstance::new("i", "vm", target(), vec![Arc::new(NoOp)], 1, 1);
        let err = instance.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PIPELINE_INIT_FAILED);
        assert_eq!(instance.state(), InstanceState::Error);
    }

    #[tokio::test]
    async fn test_execute_success_updates_metrics() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({ "ok": true }))]);
        instance.initialize().await.unwrap();

        let ctx = ExecutionContext::builder("gpt-4o-vm").build();
        let reply = instance.execute(&ctx, payload()).await.unwrap();
        assert_eq!(reply.into_complete().unwrap()["ok"], true);
        assert_eq!(instance.metrics().success_count(), 1);
        assert_eq!(instance.metrics().consecutive_errors(), 0);
        assert_eq!(instance.metrics().active_requests(), 0);
        assert_eq!(instance.state(), InstanceState::Ready);
    }

    #[tokio::test]
    async fn test_execute_failure_tags_instance_and_counts() {
        let instance = mock_instance(vec![MockOutcome::http_error(500)]);
        instance.initialize().await.unwrap();

        let ctx = ExecutionContext::builder("gpt-4o-vm").build();
        let err = instance.execute(&ctx, payload()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UPSTREAM_SERVER_ERROR);
        assert_eq!(err.instance_id.as_deref(), Some("inst-1"));
        assert_eq!(instance.metrics().error_count(), 1);
        assert_eq!(instance.metrics().consecutive_errors(), 1);
        assert_eq!(instance.metrics().active_requests(), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_errors() {
        let instance = mock_instance(vec![
            MockOutcome::http_error(500),
            MockOutcome::http_error(500),
            MockOutcome::reply(json!({})),
        ]);
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::builder("gpt-4o-vm").build();

        let _ = instance.execute(&ctx, payload()).await;
        let _ = instance.execute(&ctx, payload()).await;
        assert_eq!(instance.metrics().consecutive_errors(), 2);

        instance.execute(&ctx, payload()).await.unwrap();
        assert_eq!(instance.metrics().consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_execute_before_ready_rejected() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({}))]);
        let ctx = ExecutionContext::builder("gpt-4o-vm").build();
        let err = instance.execute(&ctx, payload()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LIFECYCLE_VIOLATION);
    }

    #[tokio::test]
    async fn test_destroy_is_terminal_and_idempotent() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({}))]);
        instance.initialize().await.unwrap();
        instance.destroy().await;
        assert_eq!(instance.state(), InstanceState::Destroyed);
        instance.destroy().await;
        assert_eq!(instance.state(), InstanceState::Destroyed);

        let ctx = ExecutionContext::builder("gpt-4o-vm").build();
        let err = instance.execute(&ctx, payload()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LIFECYCLE_VIOLATION);
    }

    #[test]
    fn test_destroyed_is_absorbing() {
        assert!(!InstanceState::Destroyed.can_transition_to(InstanceState::Ready));
        assert!(!InstanceState::Destroyed.can_transition_to(InstanceState::Destroying));
        assert!(InstanceState::Running.can_transition_to(InstanceState::Destroying));
    }

    #[tokio::test]
    async fn test_maintenance_excludes_from_eligibility() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({}))]);
        instance.initialize().await.unwrap();
        assert!(instance.is_eligible());

        instance.set_maintenance(true);
        assert!(!instance.is_eligible());
        assert_eq!(instance.state(), InstanceState::Maintenance);

        instance.set_maintenance(false);
        assert!(instance.is_eligible());
    }

    #[tokio::test]
    async fn test_disabled_excludes_from_eligibility() {
        let instance = mock_instance(vec![MockOutcome::reply(json!({}))]);
        instance.initialize().await.unwrap();
        instance.set_enabled(false);
        assert!(!instance.is_eligible());
    }

    #[tokio::test]
    async fn test_health_check_uses_probes_and_streak() {
        let instance = mock_instance(vec![MockOutcome::http_error(500)]);
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::builder("gpt-4o-vm").build();

        for _ in 0..5 {
            let _ = instance.execute(&ctx, payload()).await;
        }
        assert_eq!(
            instance.perform_health_check(10).await,
            HealthStatus::Unhealthy
        );
    }
}
