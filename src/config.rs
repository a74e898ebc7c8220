//! Scheduler configuration tree.
//!
//! Deserializes from the JSON shape the gateway's operators write (camelCase
//! field names, durations in milliseconds). Every field has a default so a
//! partial document works; [`SchedulerConfig::validate`] rejects the
//! combinations the scheduler cannot run with.

use crate::error::{ErrorCode, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Load-balancing strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
}

/// What to do with callers beyond `max_concurrent_requests`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SaturationPolicy {
    /// Wait for a slot on the bounded semaphore.
    #[default]
    Block,
    /// Fail fast with 7001 RATE_LIMIT_EXCEEDED.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub load_balancing: LoadBalancingConfig,
    pub error_handling: ErrorHandlingConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
}

impl SchedulerConfig {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.performance.default_timeout_ms == 0 {
            return Err(PipelineError::new(
                ErrorCode::INVALID_TIMEOUT,
                "performance.defaultTimeoutMs must be greater than zero",
            ));
        }
        if self.performance.max_concurrent_requests == 0 {
            return Err(PipelineError::new(
                ErrorCode::INVALID_CONFIG,
                "performance.maxConcurrentRequests must be greater than zero",
            ));
        }
        let blacklist = &self.error_handling.blacklist;
        if blacklist.default_duration_ms > blacklist.max_duration_ms {
            return Err(PipelineError::new(
                ErrorCode::INVALID_CONFIG,
                "errorHandling.blacklist.defaultDurationMs exceeds maxDurationMs",
            ));
        }
        if self.load_balancing.failover.backoff_multiplier < 1.0 {
            return Err(PipelineError::new(
                ErrorCode::INVALID_CONFIG,
                "loadBalancing.failover.backoffMultiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.performance.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancingConfig {
    pub strategy: StrategyKind,
    /// Per-virtual-model weight overrides for the weighted strategy.
    pub weights: HashMap<String, u32>,
    pub health_check: HealthCheckConfig,
    pub failover: FailoverConfig,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            weights: HashMap::new(),
            health_check: HealthCheckConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive probe passes before an instance is considered healthy again.
    pub healthy_threshold: u32,
    /// Consecutive probe failures before an instance is considered unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl FailoverConfig {
    /// Delay before retry N (0-indexed): `retry_delay * multiplier^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker (maps to temporary blacklist).
    pub failure_threshold: u32,
    pub recovery_time_ms: u64,
    /// Minimum request volume before error-rate math applies.
    pub request_volume_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time_ms: 60_000,
            request_volume_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorHandlingConfig {
    /// Per-code overrides of the default strategy table, keyed by numeric code.
    pub strategies: HashMap<u16, StrategyOverride>,
    pub blacklist: BlacklistConfig,
    pub max_error_history: usize,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            strategies: HashMap::new(),
            blacklist: BlacklistConfig::default(),
            max_error_history: 256,
        }
    }
}

/// Wire form of a per-code strategy override.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyOverride {
    /// One of: retry, failover, blacklist-temporary, blacklist-permanent,
    /// maintenance, ignore, surface.
    pub action: String,
    pub retry_count: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub blacklist_duration_ms: Option<u64>,
    pub destroy_instance_on_hit: bool,
    pub rotate_credential: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlacklistConfig {
    pub enabled: bool,
    /// Zero disables blacklisting entirely.
    pub max_entries: usize,
    pub default_duration_ms: u64,
    pub max_duration_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 128,
            default_duration_ms: 60_000,
            max_duration_ms: 3_600_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub max_concurrent_requests: usize,
    pub default_timeout_ms: u64,
    pub on_saturation: SaturationPolicy,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 128,
            default_timeout_ms: 60_000,
            on_saturation: SaturationPolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub metrics_collection_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_collection_interval_ms: 10_000,
        }
    }
}
