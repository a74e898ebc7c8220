//! Virtual-model scheduler: pool ownership, execute-with-retry, recovery.
//!
//! The scheduler owns the instance pool per virtual model, selects instances
//! through the load balancer (excluding blacklisted ones), runs each request
//! through the chosen instance under a monotonic deadline, and applies the
//! error response center's recovery actions: retry, failover, blacklist,
//! maintenance, or surface. A bounded semaphore enforces the global
//! concurrency ceiling; background tasks sweep the blacklist and probe
//! instance health.

use crate::balancer::LoadBalancer;
use crate::blacklist::BlacklistRegistry;
use crate::config::{SaturationPolicy, SchedulerConfig};
use crate::context::ExecutionContext;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::error_center::{ErrorAction, ErrorCenter};
use crate::events::{emit, Event, EventHandler};
use crate::instance::{InstanceStatus, PipelineInstance};
use crate::metrics::HealthStatus;
use crate::payload::{Payload, Reply};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;

/// Per-call options; unset fields fall back to [`SchedulerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Honored on the first attempt only, and only if eligible.
    pub preferred_instance: Option<String>,
    pub metadata: HashMap<String, String>,
    pub cancellation: Option<Arc<AtomicBool>>,
}

/// Outcome of a successful execution. Carries everything the front-end
/// exposes as `X-*` response headers.
#[derive(Debug)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub virtual_model: String,
    pub instance_id: String,
    pub retry_count: u32,
    pub processing_time: Duration,
    pub attempted_instances: Vec<String>,
    pub reply: Reply,
}

/// Aggregate scheduler counters, derived lazily at query time.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub virtual_models: usize,
    pub instances: usize,
    pub blacklist_size: usize,
    pub errors: crate::error_center::ErrorStats,
}

/// Builder for [`Scheduler`]; spawns background sweeps on build.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    events: Option<Arc<dyn EventHandler>>,
}

impl SchedulerBuilder {
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    pub fn build(self) -> Result<Arc<Scheduler>> {
        self.config.validate()?;
        let blacklist_entries = if self.config.error_handling.blacklist.enabled {
            self.config.error_handling.blacklist.max_entries
        } else {
            0
        };
        let scheduler = Arc::new(Scheduler {
            balancer: LoadBalancer::new(self.config.load_balancing.strategy),
            blacklist: Arc::new(BlacklistRegistry::new(blacklist_entries)),
            error_center: Arc::new(ErrorCenter::new(&self.config.error_handling)),
            semaphore: Arc::new(Semaphore::new(self.config.performance.max_concurrent_requests)),
            pool: RwLock::new(HashMap::new()),
            events: self.events,
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            config: self.config,
        });
        scheduler.spawn_background_tasks();
        Ok(scheduler)
    }
}

/// Owns the per-virtual-model instance pool and orchestrates execution.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: RwLock<HashMap<String, Vec<Arc<PipelineInstance>>>>,
    balancer: LoadBalancer,
    blacklist: Arc<BlacklistRegistry>,
    error_center: Arc<ErrorCenter>,
    semaphore: Arc<Semaphore>,
    events: Option<Arc<dyn EventHandler>>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("strategy", &self.config.load_balancing.strategy)
            .field("total_requests", &self.total_requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            events: None,
        }
    }

    pub fn error_center(&self) -> &Arc<ErrorCenter> {
        &self.error_center
    }

    pub fn blacklist(&self) -> &Arc<BlacklistRegistry> {
        &self.blacklist
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        // Sweeps only run when built inside a runtime; a scheduler built
        // outside one still works, minus the periodic cleanup.
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let blacklist = Arc::clone(&self.blacklist);
        let interval =
            Duration::from_millis(self.config.error_handling.blacklist.cleanup_interval_ms.max(1));
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                if scheduler.shutting_down.load(Ordering::Relaxed) {
                    return;
                }
                let removed = blacklist.cleanup(Instant::now());
                if removed > 0 {
                    tracing::debug!(removed, "blacklist sweep removed expired entries");
                }
            }
        });

        if self.config.monitoring.enabled {
            let interval = Duration::from_millis(
                self.config.monitoring.metrics_collection_interval_ms.max(1),
            );
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(scheduler) = weak.upgrade() else {
                        return;
                    };
                    if scheduler.shutting_down.load(Ordering::Relaxed) {
                        return;
                    }
                    let stats = scheduler.get_stats().await;
                    tracing::debug!(
                        total = stats.total_requests,
                        ok = stats.successful_requests,
                        failed = stats.failed_requests,
                        instances = stats.instances,
                        blacklisted = stats.blacklist_size,
                        "scheduler metrics"
                    );
                }
            });
        }

        if self.config.load_balancing.health_check.enabled {
            let interval =
                Duration::from_millis(self.config.load_balancing.health_check.interval_ms.max(1));
            let volume = self
                .config
                .load_balancing
                .failover
                .circuit_breaker
                .request_volume_threshold;
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(scheduler) = weak.upgrade() else {
                        return;
                    };
                    if scheduler.shutting_down.load(Ordering::Relaxed) {
                        return;
                    }
                    for instance in scheduler.all_instances().await {
                        let health = instance.perform_health_check(volume).await;
                        if health == HealthStatus::Unhealthy {
                            tracing::warn!(
                                instance = instance.id(),
                                virtual_model = instance.virtual_model(),
                                "health check reports unhealthy instance"
                            );
                        }
                    }
                }
            });
        }
    }

    // ---- control plane ----

    /// Initialize an instance and add it to its virtual model's pool.
    pub async fn create_pipeline(&self, instance: Arc<PipelineInstance>) -> Result<()> {
        instance.initialize().await?;
        let mut pool = self.pool.write().await;
        pool.entry(instance.virtual_model().to_string())
            .or_default()
            .push(instance);
        Ok(())
    }

    /// Destroy one instance by id. Returns whether it existed.
    pub async fn destroy_pipeline(&self, instance_id: &str) -> bool {
        let mut removed = None;
        {
            let mut pool = self.pool.write().await;
            for instances in pool.values_mut() {
                if let Some(pos) = instances.iter().position(|i| i.id() == instance_id) {
                    removed = Some(instances.remove(pos));
                    break;
                }
            }
            pool.retain(|_, instances| !instances.is_empty());
        }
        match removed {
            Some(instance) => {
                instance.destroy().await;
                self.blacklist.remove(instance_id);
                true
            }
            None => false,
        }
    }

    /// Destroy every instance of a virtual model.
    pub async fn destroy_virtual_model(&self, virtual_model: &str) -> usize {
        let removed = { self.pool.write().await.remove(virtual_model) };
        self.balancer.forget(virtual_model);
        let Some(instances) = removed else {
            return 0;
        };
        let count = instances.len();
        for instance in instances {
            self.blacklist.remove(instance.id());
            instance.destroy().await;
        }
        count
    }

    pub async fn set_enabled(&self, instance_id: &str, enabled: bool) -> bool {
        match self.find_instance(instance_id).await {
            Some(instance) => {
                instance.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Put an instance into maintenance; a duration schedules the clearing.
    pub async fn set_maintenance(
        &self,
        instance_id: &str,
        maintenance: bool,
        duration: Option<Duration>,
    ) -> bool {
        let Some(instance) = self.find_instance(instance_id).await else {
            return false;
        };
        instance.set_maintenance(maintenance);
        if maintenance {
            if let Some(duration) = duration {
                let instance = Arc::clone(&instance);
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    instance.set_maintenance(false);
                });
            }
        }
        true
    }

    pub async fn get_status(&self, virtual_model: Option<&str>) -> Vec<InstanceStatus> {
        let pool = self.pool.read().await;
        match virtual_model {
            Some(vm) => pool
                .get(vm)
                .map(|instances| instances.iter().map(|i| i.status()).collect())
                .unwrap_or_default(),
            None => pool
                .values()
                .flat_map(|instances| instances.iter().map(|i| i.status()))
                .collect(),
        }
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let pool = self.pool.read().await;
        SchedulerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            virtual_models: pool.len(),
            instances: pool.values().map(Vec::len).sum(),
            blacklist_size: self.blacklist.len(),
            errors: self.error_center.stats(),
        }
    }

    /// Probe every instance; returns health keyed by instance id.
    pub async fn health_check(&self) -> HashMap<String, HealthStatus> {
        let volume = self
            .config
            .load_balancing
            .failover
            .circuit_breaker
            .request_volume_threshold;
        let mut results = HashMap::new();
        for instance in self.all_instances().await {
            results.insert(
                instance.id().to_string(),
                instance.perform_health_check(volume).await,
            );
        }
        results
    }

    /// Stop accepting work and destroy every instance.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let drained: Vec<Arc<PipelineInstance>> = {
            let mut pool = self.pool.write().await;
            pool.drain().flat_map(|(_, instances)| instances).collect()
        };
        for instance in drained {
            instance.destroy().await;
        }
        tracing::info!("scheduler shut down");
    }

    async fn all_instances(&self) -> Vec<Arc<PipelineInstance>> {
        self.pool
            .read()
            .await
            .values()
            .flat_map(|instances| instances.iter().cloned())
            .collect()
    }

    async fn find_instance(&self, instance_id: &str) -> Option<Arc<PipelineInstance>> {
        self.pool
            .read()
            .await
            .values()
            .flat_map(|instances| instances.iter())
            .find(|i| i.id() == instance_id)
            .cloned()
    }

    /// Candidates for one attempt: eligible, not blacklisted, not excluded
    /// by this request's failovers.
    async fn candidates(
        &self,
        virtual_model: &str,
        excluded: &HashSet<String>,
    ) -> Vec<Arc<PipelineInstance>> {
        self.blacklist.cleanup(Instant::now());
        let now = Instant::now();
        self.pool
            .read()
            .await
            .get(virtual_model)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| {
                        i.is_eligible()
                            && !excluded.contains(i.id())
                            && !self.blacklist.is_blacklisted(i.id(), now)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- data plane ----

    /// Execute a payload against a virtual model with retry and failover.
    pub async fn execute(
        &self,
        virtual_model: &str,
        payload: Payload,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(PipelineError::new(
                ErrorCode::NO_AVAILABLE_PIPELINES,
                "scheduler is shutting down",
            ));
        }
        if options.timeout == Some(Duration::ZERO) {
            return Err(PipelineError::new(
                ErrorCode::INVALID_TIMEOUT,
                "timeout must be greater than zero",
            ));
        }

        let _permit = match self.config.performance.on_saturation {
            SaturationPolicy::Block => self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::new(ErrorCode::INTERNAL_ERROR, "semaphore closed"))?,
            SaturationPolicy::Reject => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(PipelineError::new(
                        ErrorCode::RATE_LIMIT_EXCEEDED,
                        "scheduler at maximum concurrent requests",
                    ))
                }
            },
        };

        let timeout = options.timeout.unwrap_or_else(|| self.config.default_timeout());
        let max_retries = options
            .max_retries
            .unwrap_or(self.config.load_balancing.failover.max_retries);

        let mut builder = ExecutionContext::builder(virtual_model)
            .timeout(timeout)
            .max_retries(max_retries);
        for (key, value) in &options.metadata {
            builder = builder.metadata(key.clone(), value.clone());
        }
        if let Some(cancel) = options.cancellation.clone() {
            builder = builder.cancellation(cancel);
        }
        let mut ctx = builder.build();

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        emit(
            &self.events,
            Event::ExecutionStart {
                execution_id: ctx.execution_id.clone(),
                virtual_model: virtual_model.to_string(),
            },
        );

        let result = self
            .execute_with_retry(&mut ctx, payload, &options)
            .await;

        match &result {
            Ok(outcome) => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
                emit(
                    &self.events,
                    Event::ExecutionEnd {
                        execution_id: ctx.execution_id.clone(),
                        instance_id: Some(outcome.instance_id.clone()),
                        ok: true,
                        retries: outcome.retry_count,
                        elapsed: ctx.elapsed(),
                    },
                );
            }
            Err(_) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                emit(
                    &self.events,
                    Event::ExecutionEnd {
                        execution_id: ctx.execution_id.clone(),
                        instance_id: ctx.instance_id.clone(),
                        ok: false,
                        retries: ctx.retry_count,
                        elapsed: ctx.elapsed(),
                    },
                );
            }
        }
        result
    }

    async fn execute_with_retry(
        &self,
        ctx: &mut ExecutionContext,
        payload: Payload,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempted: Vec<String> = Vec::new();
        let mut last_error: Option<PipelineError> = None;
        // Set when a recovery action pins the next attempt to one instance
        // (credential rotation retries the same target).
        let mut pinned: Option<Arc<PipelineInstance>> = None;
        let mut first_attempt = true;

        loop {
            ctx.check_cancelled()?;
            if ctx.deadline_exceeded() {
                return Err(self.finalize_error(
                    PipelineError::new(ErrorCode::EXECUTION_TIMEOUT, "overall deadline exceeded"),
                    ctx,
                    &attempted,
                ));
            }

            let instance = match pinned.take() {
                Some(instance) if instance.is_eligible() => instance,
                _ => {
                    let candidates = self.candidates(&ctx.virtual_model, &excluded).await;
                    if candidates.is_empty() {
                        // Exhausted through failovers: the last real failure
                        // explains more than a bare 3001.
                        if let Some(err) = last_error {
                            return Err(self.finalize_error(err, ctx, &attempted));
                        }
                        return Err(self.finalize_error(
                            PipelineError::new(
                                ErrorCode::NO_AVAILABLE_PIPELINES,
                                format!(
                                    "no eligible pipeline instances for '{}'",
                                    ctx.virtual_model
                                ),
                            ),
                            ctx,
                            &attempted,
                        ));
                    }

                    let preferred = if first_attempt {
                        options.preferred_instance.as_deref().and_then(|id| {
                            candidates.iter().find(|c| c.id() == id).cloned()
                        })
                    } else {
                        None
                    };
                    match preferred.or_else(|| self.balancer.select(&ctx.virtual_model, &candidates))
                    {
                        Some(instance) => instance,
                        None => {
                            if let Some(err) = last_error {
                                return Err(self.finalize_error(err, ctx, &attempted));
                            }
                            return Err(self.finalize_error(
                                PipelineError::new(
                                    ErrorCode::NO_AVAILABLE_PIPELINES,
                                    format!(
                                        "no selectable pipeline instances for '{}'",
                                        ctx.virtual_model
                                    ),
                                ),
                                ctx,
                                &attempted,
                            ));
                        }
                    }
                }
            };
            first_attempt = false;

            ctx.instance_id = Some(instance.id().to_string());
            attempted.push(instance.id().to_string());
            emit(
                &self.events,
                Event::Attempt {
                    execution_id: ctx.execution_id.clone(),
                    instance_id: instance.id().to_string(),
                    attempt: ctx.retry_count,
                },
            );

            let budget = ctx.attempt_budget();
            let attempt = tokio::time::timeout(budget, instance.execute(ctx, payload.clone())).await;
            let error = match attempt {
                Ok(Ok(reply)) => {
                    return Ok(ExecutionResult {
                        execution_id: ctx.execution_id.clone(),
                        virtual_model: ctx.virtual_model.clone(),
                        instance_id: instance.id().to_string(),
                        retry_count: ctx.retry_count,
                        processing_time: ctx.elapsed(),
                        attempted_instances: attempted,
                        reply,
                    });
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    instance.metrics().record_failure();
                    PipelineError::new(
                        ErrorCode::EXECUTION_TIMEOUT,
                        format!("attempt exceeded its {}ms budget", budget.as_millis()),
                    )
                    .with_instance(instance.id().to_string())
                    .with_virtual_model(ctx.virtual_model.clone())
                }
            };

            // Saturation is a skip, not a failure: try another instance
            // without consuming retry budget.
            if error.code == ErrorCode::PIPELINE_SATURATED {
                excluded.insert(instance.id().to_string());
                attempted.pop();
                continue;
            }

            tracing::warn!(
                instance = instance.id(),
                virtual_model = %ctx.virtual_model,
                code = error.code.0,
                attempt = ctx.retry_count,
                "attempt failed: {}",
                error.message
            );

            self.trip_circuit_breaker(&instance, &error);

            let action = self.error_center.handle(&error, ctx);

            match action {
                ErrorAction::Surface => {
                    return Err(self.finalize_error(error, ctx, &attempted));
                }
                ErrorAction::Ignore => {
                    return Ok(ExecutionResult {
                        execution_id: ctx.execution_id.clone(),
                        virtual_model: ctx.virtual_model.clone(),
                        instance_id: instance.id().to_string(),
                        retry_count: ctx.retry_count,
                        processing_time: ctx.elapsed(),
                        attempted_instances: attempted,
                        reply: Reply::Complete(serde_json::Value::Null),
                    });
                }
                ErrorAction::Retry {
                    delay,
                    refresh_auth,
                } => {
                    if ctx.retry_count >= ctx.max_retries {
                        return Err(self.finalize_error(error, ctx, &attempted));
                    }
                    if refresh_auth {
                        if let Err(refresh_err) = instance.refresh_auth().await {
                            return Err(self.finalize_error(refresh_err, ctx, &attempted));
                        }
                    }
                    // A timed-out instance is hung for at least this request:
                    // reselect among the others.
                    if error.code == ErrorCode::EXECUTION_TIMEOUT {
                        excluded.insert(instance.id().to_string());
                    }
                    self.sleep_before_retry(ctx, delay, &error).await;
                    ctx.retry_count += 1;
                    last_error = Some(error);
                }
                ErrorAction::Failover => {
                    if ctx.retry_count >= ctx.max_retries {
                        return Err(self.finalize_error(error, ctx, &attempted));
                    }
                    excluded.insert(instance.id().to_string());
                    ctx.retry_count += 1;
                    last_error = Some(error);
                }
                ErrorAction::BlacklistTemporary {
                    duration,
                    rotate_credential,
                } => {
                    if rotate_credential {
                        if let Some((index, wrapped)) = instance.rotate_credential() {
                            if !wrapped && ctx.retry_count < ctx.max_retries {
                                // A fresh credential on the same target is
                                // worth one immediate retry before the
                                // instance is suppressed.
                                tracing::info!(
                                    instance = instance.id(),
                                    credential_index = index,
                                    "rotated credential, retrying same target"
                                );
                                ctx.retry_count += 1;
                                pinned = Some(Arc::clone(&instance));
                                last_error = Some(error);
                                continue;
                            }
                        }
                    }
                    if ctx.retry_count >= ctx.max_retries {
                        return Err(self.finalize_error(error, ctx, &attempted));
                    }
                    self.add_to_blacklist(instance.id(), error.code, Some(duration));
                    excluded.insert(instance.id().to_string());
                    ctx.retry_count += 1;
                    last_error = Some(error);
                }
                ErrorAction::BlacklistPermanent { destroy_instance } => {
                    self.add_to_blacklist(instance.id(), error.code, None);
                    if destroy_instance {
                        let doomed = Arc::clone(&instance);
                        tokio::spawn(async move { doomed.destroy().await });
                    }
                    if ctx.retry_count >= ctx.max_retries {
                        return Err(self.finalize_error(error, ctx, &attempted));
                    }
                    excluded.insert(instance.id().to_string());
                    ctx.retry_count += 1;
                    last_error = Some(error);
                }
                ErrorAction::Maintenance { duration } => {
                    instance.set_maintenance(true);
                    let clearing = Arc::clone(&instance);
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        clearing.set_maintenance(false);
                    });
                    if ctx.retry_count >= ctx.max_retries {
                        return Err(self.finalize_error(error, ctx, &attempted));
                    }
                    excluded.insert(instance.id().to_string());
                    ctx.retry_count += 1;
                    last_error = Some(error);
                }
            }
        }
    }

    /// Consecutive failures past the breaker threshold put the instance on
    /// the temporary blacklist for the recovery window.
    fn trip_circuit_breaker(&self, instance: &Arc<PipelineInstance>, error: &PipelineError) {
        let breaker = &self.config.load_balancing.failover.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return;
        }
        if instance.metrics().consecutive_errors() >= breaker.failure_threshold {
            self.add_to_blacklist(
                instance.id(),
                error.code,
                Some(Duration::from_millis(breaker.recovery_time_ms)),
            );
        }
    }

    fn add_to_blacklist(&self, instance_id: &str, code: ErrorCode, duration: Option<Duration>) {
        let capped = duration.map(|d| {
            d.min(Duration::from_millis(
                self.config.error_handling.blacklist.max_duration_ms,
            ))
        });
        self.blacklist.add(instance_id, code, capped);
        emit(
            &self.events,
            Event::Blacklisted {
                instance_id: instance_id.to_string(),
                code,
                permanent: capped.is_none(),
            },
        );
    }

    /// Sleep before the next attempt without blowing the overall deadline.
    /// Deadline-driven timeouts already consumed their budget; retrying them
    /// immediately is the only way the remaining window is useful.
    async fn sleep_before_retry(
        &self,
        ctx: &ExecutionContext,
        delay: Duration,
        error: &PipelineError,
    ) {
        if error.code == ErrorCode::EXECUTION_TIMEOUT || delay.is_zero() {
            return;
        }
        let clamped = delay.min(ctx.remaining());
        emit(
            &self.events,
            Event::Retry {
                execution_id: ctx.execution_id.clone(),
                attempt: ctx.retry_count + 1,
                delay: clamped,
                code: error.code,
            },
        );
        tokio::time::sleep(clamped).await;
    }

    fn finalize_error(
        &self,
        error: PipelineError,
        ctx: &ExecutionContext,
        attempted: &[String],
    ) -> PipelineError {
        let mut details = error.details.clone().unwrap_or_else(|| json!({}));
        if let Some(obj) = details.as_object_mut() {
            obj.insert("executionId".into(), json!(ctx.execution_id));
            obj.insert("retryCount".into(), json!(ctx.retry_count));
            obj.insert("attemptedInstances".into(), json!(attempted));
        }
        error
            .with_virtual_model(ctx.virtual_model.clone())
            .with_details(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, StrategyKind};
    use crate::instance::Target;
    use crate::payload::{Dialect, SseFrame};
    use crate::stages::{
        MockOutcome, MockProviderStage, ProtocolSwitchStage, WorkflowStage,
    };
    use futures::StreamExt;
    use serde_json::json;

    fn target() -> Target {
        Target {
            provider_id: "p".into(),
            model_id: "m".into(),
            credential_index: 0,
        }
    }

    fn mock_instance(id: &str, script: Vec<MockOutcome>) -> Arc<PipelineInstance> {
        Arc::new(PipelineInstance::new(
            id,
            "gpt-4o-vm",
            target(),
            vec![Arc::new(MockProviderStage::new("mock", script))],
            1,
            8,
        ))
    }

    fn payload() -> Payload {
        Payload::new(
            Dialect::OpenAi,
            json!({ "messages": [{ "role": "user", "content": "hi" }] }),
        )
    }

    async fn scheduler(config: SchedulerConfig) -> Arc<Scheduler> {
        Scheduler::builder(config).build().unwrap()
    }

    fn fast_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.load_balancing.health_check.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_happy_path_round_robin_selection_order() {
        // Scenario S1: two healthy instances, three sequential requests.
        let scheduler = scheduler(fast_config()).await;
        scheduler
            .create_pipeline(mock_instance("a", vec![MockOutcome::reply(json!({"ok": 1}))]))
            .await
            .unwrap();
        scheduler
            .create_pipeline(mock_instance("b", vec![MockOutcome::reply(json!({"ok": 1}))]))
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let result = scheduler
                .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
                .await
                .unwrap();
            order.push(result.instance_id.clone());
            assert_eq!(result.retry_count, 0);
        }
        assert_eq!(order, ["a", "b", "a"]);

        let stats = scheduler.get_stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 3);
        assert_eq!(stats.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_auth_rotation_retries_same_target() {
        // Scenario S2: 401 on credential 0, success after rotating to 1.
        let scheduler = scheduler(fast_config()).await;
        let stage = Arc::new(
            MockProviderStage::new(
                "mock",
                vec![
                    MockOutcome::http_error(401),
                    MockOutcome::reply(json!({ "ok": true })),
                ],
            )
            .with_credentials(2),
        );
        let instance = Arc::new(PipelineInstance::new(
            "a",
            "gpt-4o-vm",
            target(),
            vec![stage.clone()],
            1,
            8,
        ));
        scheduler.create_pipeline(instance).await.unwrap();

        let result = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.retry_count, 1);
        assert_eq!(result.instance_id, "a");
        assert_eq!(stage.credential_index(), 1);
        assert_eq!(stage.calls(), 2);
        // Rotation succeeded, so the instance was not blacklisted.
        assert!(scheduler.blacklist().is_empty());
    }

    #[tokio::test]
    async fn test_all_blacklisted_returns_3001() {
        // Scenario S3: both instances trip the breaker, next request gets 3001.
        let mut config = fast_config();
        config.load_balancing.failover.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_time_ms: 60_000,
            request_volume_threshold: 1,
        };
        config.load_balancing.failover.max_retries = 8;
        // Keep connection-error retries from sleeping through the test.
        config.error_handling.strategies.insert(
            ErrorCode::CONNECTION_FAILED.0,
            crate::config::StrategyOverride {
                action: "retry".into(),
                retry_count: Some(8),
                retry_delay_ms: Some(0),
                ..Default::default()
            },
        );
        let scheduler = scheduler(config).await;
        scheduler
            .create_pipeline(mock_instance(
                "a",
                vec![MockOutcome::error(ErrorCode::CONNECTION_FAILED, "refused")],
            ))
            .await
            .unwrap();
        scheduler
            .create_pipeline(mock_instance(
                "b",
                vec![MockOutcome::error(ErrorCode::CONNECTION_FAILED, "refused")],
            ))
            .await
            .unwrap();

        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CONNECTION_FAILED);
        assert_eq!(scheduler.blacklist().len(), 2);

        // Both instances suppressed: the next request surfaces 3001 / 503.
        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NO_AVAILABLE_PIPELINES);
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_attempt_and_fails_over() {
        // Scenario S4: A sleeps past the budget, B answers fast.
        let scheduler = scheduler(fast_config()).await;
        scheduler
            .create_pipeline(mock_instance(
                "a",
                vec![MockOutcome::reply(json!({})).after(Duration::from_millis(5_000))],
            ))
            .await
            .unwrap();
        scheduler
            .create_pipeline(mock_instance(
                "b",
                vec![MockOutcome::reply(json!({ "ok": true })).after(Duration::from_millis(200))],
            ))
            .await
            .unwrap();

        let started = Instant::now();
        let result = scheduler
            .execute(
                "gpt-4o-vm",
                payload(),
                ExecutionOptions {
                    timeout: Some(Duration::from_millis(1_000)),
                    max_retries: Some(1),
                    preferred_instance: Some("a".into()),
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.instance_id, "b");
        assert_eq!(result.retry_count, 1);
        assert!(started.elapsed() < Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_for_retry_after() {
        // Scenario S5: 429 with Retry-After: 2 delays the next attempt by 2s.
        let scheduler = scheduler(fast_config()).await;
        scheduler
            .create_pipeline(mock_instance(
                "a",
                vec![
                    MockOutcome::http_error_with_retry_after(429, Duration::from_secs(2)),
                    MockOutcome::reply(json!({ "ok": true })),
                ],
            ))
            .await
            .unwrap();

        let started = Instant::now();
        let result = scheduler
            .execute(
                "gpt-4o-vm",
                payload(),
                ExecutionOptions {
                    timeout: Some(Duration::from_secs(10)),
                    max_retries: Some(3),
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.retry_count, 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2_100));

        let stats = scheduler.get_stats().await;
        assert_eq!(
            stats.errors.by_category[&crate::error::ErrorCategory::RateLimiting],
            1
        );
    }

    #[tokio::test]
    async fn test_streaming_transcode_end_to_end() {
        // Scenario S6: OpenAI streaming client, Anthropic-backed instance.
        let upstream_frames = vec![
            SseFrame::event(
                "message_start",
                json!({ "type": "message_start", "message": { "role": "assistant" } }).to_string(),
            ),
            SseFrame::event(
                "content_block_delta",
                json!({ "type": "content_block_delta", "delta": { "type": "text_delta", "text": "Hel" } })
                    .to_string(),
            ),
            SseFrame::event(
                "content_block_delta",
                json!({ "type": "content_block_delta", "delta": { "type": "text_delta", "text": "lo!" } })
                    .to_string(),
            ),
            SseFrame::event("message_stop", json!({ "type": "message_stop" }).to_string()),
        ];
        let instance = Arc::new(PipelineInstance::new(
            "anthropic-1",
            "claude-vm",
            target(),
            vec![
                Arc::new(ProtocolSwitchStage::new(
                    "proto",
                    Dialect::OpenAi,
                    Dialect::Anthropic,
                )),
                Arc::new(WorkflowStage::new("wf", Dialect::Anthropic, true)),
                Arc::new(MockProviderStage::new(
                    "mock",
                    vec![MockOutcome::frames(upstream_frames)],
                )),
            ],
            1,
            8,
        ));
        let scheduler = scheduler(fast_config()).await;
        scheduler.create_pipeline(instance).await.unwrap();

        let request = Payload::openai(json!({
            "model": "claude-vm",
            "stream": true,
            "messages": [{ "role": "user", "content": "hi" }],
        }));
        let result = scheduler
            .execute("claude-vm", request, ExecutionOptions::default())
            .await
            .unwrap();

        let Reply::Stream(mut stream) = result.reply else {
            panic!("expected streaming reply");
        };
        let mut content = String::new();
        let mut saw_done = false;
        while let Some(frame) = stream.next().await {
            let frame = frame.unwrap();
            if frame.is_done() {
                saw_done = true;
                continue;
            }
            if let Some(text) = frame
                .parse_json()
                .as_ref()
                .and_then(|v| v.pointer("/choices/0/delta/content"))
                .and_then(|v| v.as_str())
            {
                content.push_str(text);
            }
        }
        assert_eq!(content, "Hello!");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn test_zero_max_retries_means_one_attempt() {
        let scheduler = scheduler(fast_config()).await;
        let stage = Arc::new(MockProviderStage::new(
            "mock",
            vec![MockOutcome::http_error(500)],
        ));
        let instance = Arc::new(PipelineInstance::new(
            "a",
            "gpt-4o-vm",
            target(),
            vec![stage.clone()],
            1,
            8,
        ));
        scheduler.create_pipeline(instance).await.unwrap();

        let err = scheduler
            .execute(
                "gpt-4o-vm",
                payload(),
                ExecutionOptions {
                    max_retries: Some(0),
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UPSTREAM_SERVER_ERROR);
        assert_eq!(stage.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_candidate_failover_surfaces_original_error() {
        // One instance plus a failover action must not loop forever and must
        // keep the original failure, not a bare 3001.
        let scheduler = scheduler(fast_config()).await;
        scheduler
            .create_pipeline(mock_instance(
                "only",
                vec![MockOutcome::error(ErrorCode::INTERNAL_ERROR, "boom")],
            ))
            .await
            .unwrap();

        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
        let details = err.details.unwrap();
        assert_eq!(details["attemptedInstances"], json!(["only"]));
    }

    #[tokio::test]
    async fn test_zero_timeout_is_config_error() {
        let scheduler = scheduler(fast_config()).await;
        let err = scheduler
            .execute(
                "gpt-4o-vm",
                payload(),
                ExecutionOptions {
                    timeout: Some(Duration::ZERO),
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unknown_virtual_model_is_3001() {
        let scheduler = scheduler(fast_config()).await;
        let err = scheduler
            .execute("missing-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NO_AVAILABLE_PIPELINES);
    }

    #[tokio::test]
    async fn test_retry_count_never_exceeds_max_retries() {
        let mut config = fast_config();
        config.error_handling.strategies.insert(
            ErrorCode::UPSTREAM_SERVER_ERROR.0,
            crate::config::StrategyOverride {
                action: "retry".into(),
                retry_count: Some(99),
                retry_delay_ms: Some(0),
                ..Default::default()
            },
        );
        let scheduler = scheduler(config).await;
        let stage = Arc::new(MockProviderStage::new(
            "mock",
            vec![MockOutcome::http_error(500)],
        ));
        let instance = Arc::new(PipelineInstance::new(
            "a",
            "gpt-4o-vm",
            target(),
            vec![stage.clone()],
            1,
            8,
        ));
        scheduler.create_pipeline(instance).await.unwrap();

        let err = scheduler
            .execute(
                "gpt-4o-vm",
                payload(),
                ExecutionOptions {
                    max_retries: Some(2),
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UPSTREAM_SERVER_ERROR);
        // maxRetries=2 allows at most 3 attempts.
        assert_eq!(stage.calls(), 3);
        assert_eq!(err.details.unwrap()["retryCount"], 2);
    }

    #[tokio::test]
    async fn test_reject_policy_returns_7001_when_saturated() {
        let mut config = fast_config();
        config.performance.max_concurrent_requests = 1;
        config.performance.on_saturation = SaturationPolicy::Reject;
        let scheduler = scheduler(config).await;
        scheduler
            .create_pipeline(mock_instance(
                "a",
                vec![MockOutcome::reply(json!({})).after(Duration::from_millis(200))],
            ))
            .await
            .unwrap();

        let busy = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
                    .await
            })
        };
        // Let the first request take the only permit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RATE_LIMIT_EXCEEDED);

        busy.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ignore_action_yields_synthetic_success() {
        let scheduler = scheduler(fast_config()).await;
        scheduler.error_center().register_handler("swallow-4xx", 10, |err, _| {
            (err.code == ErrorCode::EXECUTION_FAILED).then_some(ErrorAction::Ignore)
        });
        scheduler
            .create_pipeline(mock_instance("a", vec![MockOutcome::http_error(400)]))
            .await
            .unwrap();

        let result = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap();
        assert!(matches!(result.reply, Reply::Complete(serde_json::Value::Null)));
    }

    #[tokio::test]
    async fn test_preferred_instance_first_attempt_only() {
        let mut config = fast_config();
        config.load_balancing.strategy = StrategyKind::RoundRobin;
        let scheduler = scheduler(config).await;
        scheduler
            .create_pipeline(mock_instance("a", vec![MockOutcome::reply(json!({}))]))
            .await
            .unwrap();
        scheduler
            .create_pipeline(mock_instance("b", vec![MockOutcome::reply(json!({}))]))
            .await
            .unwrap();

        let result = scheduler
            .execute(
                "gpt-4o-vm",
                payload(),
                ExecutionOptions {
                    preferred_instance: Some("b".into()),
                    ..ExecutionOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.instance_id, "b");
    }

    #[tokio::test]
    async fn test_control_plane_lifecycle() {
        let scheduler = scheduler(fast_config()).await;
        scheduler
            .create_pipeline(mock_instance("a", vec![MockOutcome::reply(json!({}))]))
            .await
            .unwrap();
        scheduler
            .create_pipeline(mock_instance("b", vec![MockOutcome::reply(json!({}))]))
            .await
            .unwrap();

        assert_eq!(scheduler.get_status(Some("gpt-4o-vm")).await.len(), 2);

        assert!(scheduler.set_enabled("a", false).await);
        let result = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.instance_id, "b");

        assert!(scheduler.destroy_pipeline("b").await);
        assert!(!scheduler.destroy_pipeline("b").await);
        assert!(scheduler.set_enabled("a", true).await);
        assert_eq!(scheduler.get_status(None).await.len(), 1);

        assert_eq!(scheduler.destroy_virtual_model("gpt-4o-vm").await, 1);
        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NO_AVAILABLE_PIPELINES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_action_clears_after_duration() {
        let mut config = fast_config();
        config.error_handling.strategies.insert(
            ErrorCode::RESOURCE_EXHAUSTED.0,
            crate::config::StrategyOverride {
                action: "maintenance".into(),
                blacklist_duration_ms: Some(1_000),
                ..Default::default()
            },
        );
        let scheduler = scheduler(config).await;
        scheduler
            .create_pipeline(mock_instance(
                "a",
                vec![
                    MockOutcome::error(ErrorCode::RESOURCE_EXHAUSTED, "disk full"),
                    MockOutcome::reply(json!({})),
                ],
            ))
            .await
            .unwrap();

        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RESOURCE_EXHAUSTED);
        let status = &scheduler.get_status(Some("gpt-4o-vm")).await[0];
        assert!(status.in_maintenance);

        // The scheduled clearing returns the instance to service.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let result = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.instance_id, "a");
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let scheduler = scheduler(fast_config()).await;
        scheduler
            .create_pipeline(mock_instance("a", vec![MockOutcome::reply(json!({}))]))
            .await
            .unwrap();
        scheduler.shutdown().await;

        let err = scheduler
            .execute("gpt-4o-vm", payload(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NO_AVAILABLE_PIPELINES);
        assert_eq!(scheduler.get_stats().await.instances, 0);
    }
}
