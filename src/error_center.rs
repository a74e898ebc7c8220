//! Error response center: classification, recovery strategy, bookkeeping.
//!
//! Every failure the scheduler sees passes through [`ErrorCenter::handle`]:
//! the error keeps its code (raw failures were already classified at the
//! boundary), counters and the bounded history ring are updated, the
//! per-code strategy table (with category fallbacks) picks a recovery
//! [`ErrorAction`], and registered custom handlers get a chance to replace
//! it, highest priority first.

use crate::config::{ErrorHandlingConfig, StrategyOverride};
use crate::context::ExecutionContext;
use crate::error::{ErrorCategory, ErrorCode, PipelineError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Recovery action decided for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Sleep `delay`, optionally refresh auth material, and try again
    /// (the load balancer reselects unless the scheduler pins the instance).
    Retry { delay: Duration, refresh_auth: bool },
    /// Exclude the current instance for this request and try another.
    Failover,
    /// Temporarily blacklist the instance, optionally rotating to the next
    /// credential first, then fail over.
    BlacklistTemporary {
        duration: Duration,
        rotate_credential: bool,
    },
    /// Permanently blacklist the instance, optionally destroying it.
    BlacklistPermanent { destroy_instance: bool },
    /// Put the instance into maintenance for `duration`, then fail over.
    Maintenance { duration: Duration },
    /// Swallow the error and return a synthetic success.
    Ignore,
    /// Return the error to the caller as-is.
    Surface,
}

/// The verb of a strategy, without its tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Retry,
    Failover,
    BlacklistTemporary,
    BlacklistPermanent,
    Maintenance,
    Ignore,
    Surface,
}

impl ActionKind {
    fn parse(name: &str) -> Option<ActionKind> {
        Some(match name {
            "retry" => ActionKind::Retry,
            "failover" => ActionKind::Failover,
            "blacklist-temporary" => ActionKind::BlacklistTemporary,
            "blacklist-permanent" => ActionKind::BlacklistPermanent,
            "maintenance" => ActionKind::Maintenance,
            "ignore" => ActionKind::Ignore,
            "surface" => ActionKind::Surface,
            _ => return None,
        })
    }
}

/// Per-code (or per-category) recovery strategy.
#[derive(Debug, Clone)]
pub struct ErrorHandlingStrategy {
    pub action: ActionKind,
    /// Retries this strategy consumes before escalating.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub blacklist_duration: Duration,
    pub destroy_instance_on_hit: bool,
    pub rotate_credential: bool,
    pub refresh_auth: bool,
}

impl Default for ErrorHandlingStrategy {
    fn default() -> Self {
        Self {
            action: ActionKind::Surface,
            retry_count: 0,
            retry_delay: Duration::ZERO,
            exponential_backoff: false,
            blacklist_duration: Duration::from_secs(60),
            destroy_instance_on_hit: false,
            rotate_credential: false,
            refresh_auth: false,
        }
    }
}

impl ErrorHandlingStrategy {
    fn retry(count: u32, delay_ms: u64) -> Self {
        Self {
            action: ActionKind::Retry,
            retry_count: count,
            retry_delay: Duration::from_millis(delay_ms),
            ..Self::default()
        }
    }

    fn failover(count: u32) -> Self {
        Self {
            action: ActionKind::Failover,
            retry_count: count,
            ..Self::default()
        }
    }

    fn surface() -> Self {
        Self::default()
    }

    fn apply_override(mut self, over: &StrategyOverride) -> Self {
        if let Some(kind) = ActionKind::parse(&over.action) {
            self.action = kind;
        }
        if let Some(count) = over.retry_count {
            self.retry_count = count;
        }
        if let Some(delay) = over.retry_delay_ms {
            self.retry_delay = Duration::from_millis(delay);
        }
        if let Some(duration) = over.blacklist_duration_ms {
            self.blacklist_duration = Duration::from_millis(duration);
        }
        self.destroy_instance_on_hit |= over.destroy_instance_on_hit;
        self.rotate_credential |= over.rotate_credential;
        self
    }
}

/// One entry in the bounded recent-error ring.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    pub execution_id: String,
    pub virtual_model: Option<String>,
    pub instance_id: Option<String>,
    pub timestamp: SystemTime,
}

/// Aggregated error counters.
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total: u64,
    pub by_code: HashMap<u16, u64>,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_instance: HashMap<String, u64>,
    pub by_virtual_model: HashMap<String, u64>,
}

type HandlerFn = dyn Fn(&PipelineError, &ErrorAction) -> Option<ErrorAction> + Send + Sync;

struct CustomHandler {
    name: String,
    priority: i32,
    handler: Arc<HandlerFn>,
}

impl std::fmt::Debug for CustomHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomHandler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Classifies failures and produces recovery actions.
#[derive(Debug)]
pub struct ErrorCenter {
    strategies: HashMap<u16, ErrorHandlingStrategy>,
    stats: Mutex<ErrorStats>,
    history: Mutex<VecDeque<ErrorRecord>>,
    max_history: usize,
    handlers: RwLock<Vec<CustomHandler>>,
}

impl ErrorCenter {
    pub fn new(config: &ErrorHandlingConfig) -> Self {
        let mut strategies = Self::default_strategies();
        for (code, over) in &config.strategies {
            let base = strategies.remove(code).unwrap_or_default();
            strategies.insert(*code, base.apply_override(over));
        }
        Self {
            strategies,
            stats: Mutex::new(ErrorStats::default()),
            history: Mutex::new(VecDeque::new()),
            max_history: config.max_error_history.max(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// The authoritative per-code defaults; category defaults cover the rest.
    fn default_strategies() -> HashMap<u16, ErrorHandlingStrategy> {
        let mut map = HashMap::new();
        map.insert(
            ErrorCode::EXECUTION_TIMEOUT.0,
            ErrorHandlingStrategy::retry(2, 1_000),
        );
        map.insert(ErrorCode::CONNECTION_FAILED.0, {
            let mut s = ErrorHandlingStrategy::retry(3, 500);
            s.exponential_backoff = true;
            s
        });
        map.insert(ErrorCode::AUTH_FAILED.0, ErrorHandlingStrategy {
            action: ActionKind::BlacklistTemporary,
            retry_count: 1,
            blacklist_duration: Duration::from_secs(300),
            rotate_credential: true,
            ..ErrorHandlingStrategy::default()
        });
        map.insert(ErrorCode::TOKEN_EXPIRED.0, ErrorHandlingStrategy {
            action: ActionKind::Retry,
            retry_count: 1,
            retry_delay: Duration::ZERO,
            refresh_auth: true,
            ..ErrorHandlingStrategy::default()
        });
        map.insert(ErrorCode::RATE_LIMIT_EXCEEDED.0, ErrorHandlingStrategy {
            action: ActionKind::Retry,
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
            exponential_backoff: true,
            blacklist_duration: Duration::from_secs(60),
            ..ErrorHandlingStrategy::default()
        });
        map.insert(
            ErrorCode::UPSTREAM_SERVER_ERROR.0,
            ErrorHandlingStrategy::failover(2),
        );
        map.insert(
            ErrorCode::INTERNAL_ERROR.0,
            ErrorHandlingStrategy::failover(2),
        );
        map.insert(
            ErrorCode::NO_AVAILABLE_PIPELINES.0,
            ErrorHandlingStrategy::surface(),
        );
        map.insert(
            ErrorCode::PIPELINE_SATURATED.0,
            ErrorHandlingStrategy::failover(0),
        );
        map
    }

    fn category_default(category: ErrorCategory) -> ErrorHandlingStrategy {
        match category {
            ErrorCategory::Execution => ErrorHandlingStrategy::retry(2, 1_000),
            ErrorCategory::Network => {
                let mut s = ErrorHandlingStrategy::retry(3, 500);
                s.exponential_backoff = true;
                s
            }
            ErrorCategory::Authentication => ErrorHandlingStrategy {
                action: ActionKind::BlacklistTemporary,
                retry_count: 1,
                blacklist_duration: Duration::from_secs(300),
                rotate_credential: true,
                ..ErrorHandlingStrategy::default()
            },
            ErrorCategory::RateLimiting => ErrorHandlingStrategy {
                action: ActionKind::Retry,
                retry_count: 3,
                retry_delay: Duration::from_secs(2),
                exponential_backoff: true,
                ..ErrorHandlingStrategy::default()
            },
            ErrorCategory::Resource | ErrorCategory::System => ErrorHandlingStrategy::failover(2),
            ErrorCategory::Configuration
            | ErrorCategory::Lifecycle
            | ErrorCategory::Scheduling
            | ErrorCategory::Data
            | ErrorCategory::ProviderAuth => ErrorHandlingStrategy::surface(),
        }
    }

    pub fn strategy_for(&self, code: ErrorCode) -> ErrorHandlingStrategy {
        self.strategies
            .get(&code.0)
            .cloned()
            .unwrap_or_else(|| Self::category_default(code.category()))
    }

    /// Register a custom handler. Higher priority runs first; a handler may
    /// replace the action by returning `Some`. Handlers must be pure or
    /// idempotent: they run again on every retry of the same request.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        priority: i32,
        handler: impl Fn(&PipelineError, &ErrorAction) -> Option<ErrorAction> + Send + Sync + 'static,
    ) {
        let mut handlers = self.handlers.write();
        handlers.push(CustomHandler {
            name: name.into(),
            priority,
            handler: Arc::new(handler),
        });
        handlers.sort_by_key(|h| std::cmp::Reverse(h.priority));
    }

    /// Classify a failure, record it, and produce its recovery action.
    pub fn handle(&self, error: &PipelineError, ctx: &ExecutionContext) -> ErrorAction {
        self.record(error, ctx);

        let strategy = self.strategy_for(error.code);
        let mut action = self.decide(error, &strategy, ctx);

        for custom in self.handlers.read().iter() {
            if let Some(replacement) = (custom.handler)(error, &action) {
                tracing::debug!(
                    handler = %custom.name,
                    code = error.code.0,
                    "custom handler replaced error action"
                );
                action = replacement;
            }
        }
        action
    }

    fn decide(
        &self,
        error: &PipelineError,
        strategy: &ErrorHandlingStrategy,
        ctx: &ExecutionContext,
    ) -> ErrorAction {
        let budget_spent = ctx.retry_count >= strategy.retry_count;
        match strategy.action {
            ActionKind::Surface => ErrorAction::Surface,
            ActionKind::Ignore => ErrorAction::Ignore,
            ActionKind::Failover => {
                if strategy.retry_count > 0 && budget_spent {
                    ErrorAction::Surface
                } else {
                    ErrorAction::Failover
                }
            }
            ActionKind::Maintenance => ErrorAction::Maintenance {
                duration: strategy.blacklist_duration,
            },
            ActionKind::BlacklistPermanent => ErrorAction::BlacklistPermanent {
                destroy_instance: strategy.destroy_instance_on_hit,
            },
            ActionKind::BlacklistTemporary => ErrorAction::BlacklistTemporary {
                duration: strategy.blacklist_duration,
                rotate_credential: strategy.rotate_credential,
            },
            ActionKind::Retry => {
                if budget_spent {
                    // Per-code retries spent: rate limits escalate to a short
                    // blacklist, auth surfaces, the rest fail over.
                    return match error.category() {
                        ErrorCategory::RateLimiting => ErrorAction::BlacklistTemporary {
                            duration: strategy.blacklist_duration,
                            rotate_credential: false,
                        },
                        ErrorCategory::Authentication | ErrorCategory::ProviderAuth => {
                            ErrorAction::Surface
                        }
                        _ => ErrorAction::Failover,
                    };
                }
                let delay = match error.retry_after {
                    // Upstream said when to come back; believe it.
                    Some(hint) => hint,
                    None if strategy.exponential_backoff => {
                        let factor = 2u32.saturating_pow(ctx.retry_count);
                        strategy.retry_delay.saturating_mul(factor)
                    }
                    None => strategy.retry_delay,
                };
                ErrorAction::Retry {
                    delay,
                    refresh_auth: strategy.refresh_auth,
                }
            }
        }
    }

    fn record(&self, error: &PipelineError, ctx: &ExecutionContext) {
        {
            let mut stats = self.stats.lock();
            stats.total += 1;
            *stats.by_code.entry(error.code.0).or_insert(0) += 1;
            *stats.by_category.entry(error.category()).or_insert(0) += 1;
            if let Some(ref instance) = error.instance_id {
                *stats.by_instance.entry(instance.clone()).or_insert(0) += 1;
            }
            let vm = error
                .virtual_model
                .clone()
                .unwrap_or_else(|| ctx.virtual_model.clone());
            *stats.by_virtual_model.entry(vm).or_insert(0) += 1;
        }

        let mut history = self.history.lock();
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(ErrorRecord {
            code: error.code,
            category: error.category(),
            message: error.message.clone(),
            execution_id: ctx.execution_id.clone(),
            virtual_model: error.virtual_model.clone(),
            instance_id: error.instance_id.clone(),
            timestamp: error.timestamp,
        });
    }

    pub fn stats(&self) -> ErrorStats {
        self.stats.lock().clone()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.history.lock().iter().cloned().collect()
    }
}
