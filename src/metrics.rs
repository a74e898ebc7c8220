//! Per-instance metrics: atomic counters plus an EWMA response time.
//!
//! The owning instance is the sole writer; readers (load balancer,
//! `get_stats`) see monotonically non-decreasing counts but may observe
//! slightly stale composites. Health is derived from consecutive errors and
//! error rate: Healthy below 10% with a clean streak, Degraded in
//! [10%, 30%), Unhealthy at 30%+ or five consecutive errors.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// EWMA smoothing factor for the response-time average.
const EWMA_ALPHA: f64 = 0.2;
/// Consecutive errors at which an instance is unhealthy regardless of rate.
pub const CONSECUTIVE_ERROR_THRESHOLD: u32 = 5;
const DEGRADED_ERROR_RATE: f64 = 0.10;
const UNHEALTHY_ERROR_RATE: f64 = 0.30;

/// Derived health of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Atomic counters owned by one pipeline instance.
#[derive(Debug)]
pub struct InstanceMetrics {
    request_count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_errors: AtomicU32,
    active_requests: AtomicUsize,
    /// EWMA of response time in microseconds; zero until the first sample.
    avg_response_micros: AtomicU64,
    /// Epoch millis; zero means never.
    last_success_at: AtomicU64,
    last_error_at: AtomicU64,
    started_at: Instant,
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            active_requests: AtomicUsize::new(0),
            avg_response_micros: AtomicU64::new(0),
            last_success_at: AtomicU64::new(0),
            last_error_at: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

impl InstanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_request(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a successful execution: resets the consecutive-error streak
    /// and folds the duration into the EWMA.
    pub fn record_success(&self, duration: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.last_success_at.store(epoch_millis(), Ordering::Relaxed);

        let sample = duration.as_micros() as u64;
        let old = self.avg_response_micros.load(Ordering::Relaxed);
        let updated = if old == 0 {
            sample
        } else {
            (old as f64 * (1.0 - EWMA_ALPHA) + sample as f64 * EWMA_ALPHA) as u64
        };
        self.avg_response_micros.store(updated, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        self.last_error_at.store(epoch_millis(), Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn average_response_time(&self) -> Duration {
        Duration::from_micros(self.avg_response_micros.load(Ordering::Relaxed))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Errors over completed requests; zero before any completion.
    pub fn error_rate(&self) -> f64 {
        let errors = self.error_count() as f64;
        let completed = (self.success_count() + self.error_count()) as f64;
        if completed == 0.0 {
            0.0
        } else {
            errors / completed
        }
    }

    /// Health from the threshold arithmetic. `volume_threshold` suppresses
    /// rate-based judgments until enough requests have completed.
    pub fn health(&self, volume_threshold: u64) -> HealthStatus {
        let completed = self.success_count() + self.error_count();
        if completed == 0 {
            return HealthStatus::Unknown;
        }
        if self.consecutive_errors() >= CONSECUTIVE_ERROR_THRESHOLD {
            return HealthStatus::Unhealthy;
        }
        if completed < volume_threshold {
            // Not enough volume for rate math; streak alone decides.
            return if self.consecutive_errors() == 0 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            };
        }
        let rate = self.error_rate();
        if rate >= UNHEALTHY_ERROR_RATE {
            HealthStatus::Unhealthy
        } else if rate >= DEGRADED_ERROR_RATE || self.consecutive_errors() > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count(),
            success_count: self.success_count(),
            error_count: self.error_count(),
            consecutive_errors: self.consecutive_errors(),
            active_requests: self.active_requests(),
            average_response_time_ms: self.average_response_time().as_millis() as u64,
            error_rate: self.error_rate(),
            uptime_ms: self.uptime().as_millis() as u64,
            last_success_at: self.last_success_at.load(Ordering::Relaxed),
            last_error_at: self.last_error_at.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, for status and stats responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub active_requests: usize,
    pub average_response_time_ms: u64,
    pub error_rate: f64,
    pub uptime_ms: u64,
    pub last_success_at: u64,
    pub last_error_at: u64,
}
