use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level error family. Every [`ErrorCode`] belongs to exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Driver,
    Llm,
    Network,
    Validation,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Llm => "llm",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Fatal,
    Error,
    Warning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // driver
    NotFound,
    InitFailed,
    ReceiveFailed,
    Aborted,
    // llm
    RateLimited,
    Overloaded,
    ApiError,
    // network
    Timeout,
    ConnectionRefused,
    // validation
    InvalidInput,
    MalformedToolInput,
    // system
    Internal,
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound | Self::InitFailed | Self::ReceiveFailed | Self::Aborted => {
                ErrorCategory::Driver
            }
            Self::RateLimited | Self::Overloaded | Self::ApiError => ErrorCategory::Llm,
            Self::Timeout | Self::ConnectionRefused => ErrorCategory::Network,
            Self::InvalidInput | Self::MalformedToolInput => ErrorCategory::Validation,
            Self::Internal => ErrorCategory::System,
        }
    }

    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            Self::NotFound | Self::InitFailed => ErrorSeverity::Fatal,
            Self::Aborted => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Whether the agent can keep serving turns after this error.
    pub fn default_recoverable(&self) -> bool {
        !matches!(self, Self::NotFound | Self::InitFailed | Self::Internal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InitFailed => "INIT_FAILED",
            Self::ReceiveFailed => "RECEIVE_FAILED",
            Self::Aborted => "ABORTED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Overloaded => "OVERLOADED",
            Self::ApiError => "API_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::MalformedToolInput => "MALFORMED_TOOL_INPUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error as it travels on the bus: classified, serialisable, and
/// carrying its own severity and recoverability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category}/{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct AgentError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            severity: code.default_severity(),
            recoverable: code.default_recoverable(),
            message: message.into(),
            details: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("request timed out after {}ms", after.as_millis()),
        )
        .with_details(serde_json::json!({ "timeoutMs": after.as_millis() as u64 }))
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, reason)
    }

    pub fn malformed_tool_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedToolInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

/// Failure reported by a provider adapter's `receive()` call itself.
/// Mid-stream failures travel as `StreamEvent::Error` instead.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter not found: {0}")]
    NotFound(String),
    #[error("adapter init failed: {0}")]
    InitFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider overloaded")]
    Overloaded,
    #[error("provider api error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Overloaded
                | Self::ConnectionRefused(_)
                | Self::Timeout(_)
        ) || matches!(self, Self::Api { status, .. } if *status >= 500)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InitFailed(_) => "init_failed",
            Self::ReceiveFailed(_) => "receive_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::Api { .. } => "api_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionRefused(_) => "connection_refused",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InitFailed(_) => ErrorCode::InitFailed,
            Self::ReceiveFailed(_) => ErrorCode::ReceiveFailed,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Overloaded => ErrorCode::Overloaded,
            Self::Api { .. } => ErrorCode::ApiError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            Self::Cancelled => ErrorCode::Aborted,
        }
    }

    /// Classify an HTTP status code from a provider API.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            _ => Self::Api { status, body },
        }
    }
}

impl From<&AdapterError> for AgentError {
    fn from(e: &AdapterError) -> Self {
        let err = AgentError::new(e.code(), e.to_string());
        match e {
            AdapterError::RateLimited {
                retry_after: Some(d),
            } => err.with_details(serde_json::json!({ "retryAfterMs": d.as_millis() as u64 })),
            AdapterError::Api { status, .. } => {
                let err = err.with_details(serde_json::json!({ "status": status }));
                if (400..500).contains(status) {
                    err.with_recoverable(false)
                } else {
                    err
                }
            }
            AdapterError::Timeout(d) => {
                err.with_details(serde_json::json!({ "timeoutMs": d.as_millis() as u64 }))
            }
            _ => err,
        }
    }
}
