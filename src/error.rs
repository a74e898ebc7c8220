//! Error taxonomy for the gateway.
//!
//! Every failure becomes a [`PipelineError`] before it leaves the scheduler.
//! Codes are numeric bands: 1xxx configuration, 2xxx lifecycle, 3xxx
//! scheduling, 4xxx execution, 5xxx network, 6xxx authentication, 7xxx rate
//! limiting, 8xxx resource, 9xxx data, 10xxx system, 11xxx provider
//! device-code auth. Category, severity, and recoverability are derived from
//! the band; the HTTP status map is total and never yields 2xx.

use serde_json::{json, Value};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Numeric error code. The band (`code / 1000`) encodes the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const INVALID_CONFIG: ErrorCode = ErrorCode(1001);
    pub const INVALID_TIMEOUT: ErrorCode = ErrorCode(1003);

    pub const LIFECYCLE_VIOLATION: ErrorCode = ErrorCode(2001);
    pub const PIPELINE_INIT_FAILED: ErrorCode = ErrorCode(2002);

    pub const NO_AVAILABLE_PIPELINES: ErrorCode = ErrorCode(3001);
    pub const PIPELINE_SATURATED: ErrorCode = ErrorCode(3002);
    pub const PIPELINE_SELECTION_FAILED: ErrorCode = ErrorCode(3005);

    pub const EXECUTION_FAILED: ErrorCode = ErrorCode(4001);
    pub const EXECUTION_TIMEOUT: ErrorCode = ErrorCode(4002);
    pub const EXECUTION_CANCELLED: ErrorCode = ErrorCode(4003);
    pub const UPSTREAM_SERVER_ERROR: ErrorCode = ErrorCode(4005);

    pub const CONNECTION_FAILED: ErrorCode = ErrorCode(5001);

    pub const AUTH_FAILED: ErrorCode = ErrorCode(6001);
    pub const FORBIDDEN: ErrorCode = ErrorCode(6002);
    pub const TOKEN_EXPIRED: ErrorCode = ErrorCode(6003);
    pub const CREDENTIALS_EXHAUSTED: ErrorCode = ErrorCode(6005);

    pub const RATE_LIMIT_EXCEEDED: ErrorCode = ErrorCode(7001);

    pub const RESOURCE_EXHAUSTED: ErrorCode = ErrorCode(8001);

    pub const DECODE_FAILED: ErrorCode = ErrorCode(9001);
    pub const VALIDATION_FAILED: ErrorCode = ErrorCode(9002);

    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(10001);

    pub const DEVICE_CODE_PENDING: ErrorCode = ErrorCode(11001);
    pub const DEVICE_CODE_EXPIRED: ErrorCode = ErrorCode(11003);

    /// The category encoded by this code's numeric band.
    pub fn category(self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Configuration,
            2 => ErrorCategory::Lifecycle,
            3 => ErrorCategory::Scheduling,
            4 => ErrorCategory::Execution,
            5 => ErrorCategory::Network,
            6 => ErrorCategory::Authentication,
            7 => ErrorCategory::RateLimiting,
            8 => ErrorCategory::Resource,
            9 => ErrorCategory::Data,
            11 => ErrorCategory::ProviderAuth,
            _ => ErrorCategory::System,
        }
    }

    /// Map this code to an HTTP response status. Total; always 4xx or 5xx.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::EXECUTION_TIMEOUT => 504,
            ErrorCode::EXECUTION_CANCELLED => 499,
            ErrorCode::UPSTREAM_SERVER_ERROR => 502,
            ErrorCode::PIPELINE_SELECTION_FAILED => 404,
            ErrorCode::FORBIDDEN => 403,
            ErrorCode::VALIDATION_FAILED => 400,
            _ => match self.category() {
                ErrorCategory::Configuration => 500,
                ErrorCategory::Lifecycle => 500,
                ErrorCategory::Scheduling => 503,
                ErrorCategory::Execution => 500,
                ErrorCategory::Network => 502,
                ErrorCategory::Authentication => 401,
                ErrorCategory::RateLimiting => 429,
                ErrorCategory::Resource => 503,
                ErrorCategory::Data => 502,
                ErrorCategory::System => 500,
                ErrorCategory::ProviderAuth => 401,
            },
        }
    }

    /// Default severity for this code's band.
    pub fn severity(self) -> Severity {
        match self.category() {
            ErrorCategory::Lifecycle | ErrorCategory::System => Severity::Critical,
            ErrorCategory::Configuration
            | ErrorCategory::Scheduling
            | ErrorCategory::Authentication
            | ErrorCategory::Resource => Severity::High,
            ErrorCategory::Execution
            | ErrorCategory::Network
            | ErrorCategory::Data
            | ErrorCategory::ProviderAuth => Severity::Medium,
            ErrorCategory::RateLimiting => Severity::Low,
        }
    }

    /// Default recoverability for this code's band.
    pub fn recoverability(self) -> Recoverability {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Lifecycle | ErrorCategory::Data => {
                Recoverability::NonRecoverable
            }
            ErrorCategory::Execution | ErrorCategory::Network | ErrorCategory::RateLimiting => {
                Recoverability::AutoRecoverable
            }
            ErrorCategory::Scheduling
            | ErrorCategory::Authentication
            | ErrorCategory::Resource
            | ErrorCategory::System
            | ErrorCategory::ProviderAuth => Recoverability::Recoverable,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure category, encoded by the code band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Lifecycle,
    Scheduling,
    Execution,
    Network,
    Authentication,
    RateLimiting,
    Resource,
    Data,
    System,
    ProviderAuth,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Lifecycle => "lifecycle",
            ErrorCategory::Scheduling => "scheduling",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimiting => "rate_limiting",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Data => "data",
            ErrorCategory::System => "system",
            ErrorCategory::ProviderAuth => "provider_auth",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    Recoverable,
    AutoRecoverable,
    NonRecoverable,
}

impl Recoverability {
    pub fn as_str(self) -> &'static str {
        match self {
            Recoverability::Recoverable => "recoverable",
            Recoverability::AutoRecoverable => "auto_recoverable",
            Recoverability::NonRecoverable => "non_recoverable",
        }
    }
}

/// A classified gateway failure.
///
/// Carries the numeric code plus everything the error response center and
/// the front-end need: severity, recoverability, the owning virtual model
/// and instance when known, provider details, and the `Retry-After` hint
/// parsed from upstream rate-limit responses.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub recoverability: Recoverability,
    pub virtual_model: Option<String>,
    pub instance_id: Option<String>,
    /// Provider response body or other structured context.
    pub details: Option<Value>,
    /// Parsed `Retry-After` value, when the upstream sent one.
    pub retry_after: Option<Duration>,
    pub timestamp: SystemTime,
}

impl PipelineError {
    /// Create an error with band-default severity and recoverability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: code.severity(),
            recoverability: code.recoverability(),
            virtual_model: None,
            instance_id: None,
            details: None,
            retry_after: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_virtual_model(mut self, vm: impl Into<String>) -> Self {
        self.virtual_model = Some(vm.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Classify an upstream HTTP error status into the taxonomy.
    pub fn from_http_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        let code = match status {
            401 => ErrorCode::AUTH_FAILED,
            403 => ErrorCode::FORBIDDEN,
            408 => ErrorCode::EXECUTION_TIMEOUT,
            429 => ErrorCode::RATE_LIMIT_EXCEEDED,
            s if s >= 500 => ErrorCode::UPSTREAM_SERVER_ERROR,
            _ => ErrorCode::EXECUTION_FAILED,
        };
        let mut err = Self::new(code, format!("upstream returned HTTP {}", status))
            .with_details(json!({ "status": status, "body": body }));
        if let Some(delay) = retry_after {
            err = err.with_retry_after(delay);
        }
        err
    }

    /// The JSON error envelope returned to clients.
    ///
    /// `{"error": {code, message, category, severity, httpStatus,
    /// executionId, retryCount}}`
    pub fn envelope(&self, execution_id: &str, retry_count: u32) -> Value {
        json!({
            "error": {
                "code": self.code.0,
                "message": self.message,
                "category": self.category().as_str(),
                "severity": self.severity.as_str(),
                "httpStatus": self.http_status(),
                "executionId": execution_id,
                "retryCount": retry_count,
            }
        })
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::EXECUTION_TIMEOUT
        } else if err.is_decode() {
            ErrorCode::DECODE_FAILED
        } else {
            ErrorCode::CONNECTION_FAILED
        };
        Self::new(code, format!("transport failure: {}", err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::DECODE_FAILED, format!("decode failure: {}", err))
    }
}

impl Clone for PipelineError {
    fn clone(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            severity: self.severity,
            recoverability: self.recoverability,
            virtual_model: self.virtual_model.clone(),
            instance_id: self.instance_id.clone(),
            details: self.details.clone(),
            retry_after: self.retry_after,
            timestamp: self.timestamp,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// All named codes; used by the HTTP-map totality test and the error center
/// when seeding default strategies.
pub const NAMED_CODES: &[ErrorCode] = &[
    ErrorCode::INVALID_CONFIG,
    ErrorCode::INVALID_TIMEOUT,
    ErrorCode::LIFECYCLE_VIOLATION,
    ErrorCode::PIPELINE_INIT_FAILED,
    ErrorCode::NO_AVAILABLE_PIPELINES,
    ErrorCode::PIPELINE_SATURATED,
    ErrorCode::PIPELINE_SELECTION_FAILED,
    ErrorCode::EXECUTION_FAILED,
    ErrorCode::EXECUTION_TIMEOUT,
    ErrorCode::EXECUTION_CANCELLED,
    ErrorCode::UPSTREAM_SERVER_ERROR,
    ErrorCode::CONNECTION_FAILED,
    ErrorCode::AUTH_FAILED,
    ErrorCode::FORBIDDEN,
    ErrorCode::TOKEN_EXPIRED,
    ErrorCode::CREDENTIALS_EXHAUSTED,
    ErrorCode::RATE_LIMIT_EXCEEDED,
    ErrorCode::RESOURCE_EXHAUSTED,
    ErrorCode::DECODE_FAILED,
    ErrorCode::VALIDATION_FAILED,
    ErrorCode::INTERNAL_ERROR,
    ErrorCode::DEVICE_CODE_PENDING,
    ErrorCode::DEVICE_CODE_EXPIRED,
];
