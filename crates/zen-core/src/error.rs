use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Closed set of failure classes. Callers branch on the code, never on the
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    VersionMismatch,
    ExecutionFailed,
    Timeout,
    Canceled,
    ParseFailed,
    InvalidOperation,
    AuthFailed,
    RateLimited,
    NetworkError,
    SyncConflict,
    InvalidData,
    ConfigError,
    ProviderError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Canceled => "canceled",
            ErrorCode::ParseFailed => "parse_failed",
            ErrorCode::InvalidOperation => "invalid_operation",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::SyncConflict => "sync_conflict",
            ErrorCode::InvalidData => "invalid_data",
            ErrorCode::ConfigError => "config_error",
            ErrorCode::ProviderError => "provider_error",
        }
    }

    /// Whether an operation failing with this code may be retried in-band.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::RateLimited
                | ErrorCode::Timeout
                | ErrorCode::ProviderError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = ZenError;

    fn from_str(s: &str) -> Result<Self> {
        let code = match s {
            "not_found" => ErrorCode::NotFound,
            "already_exists" => ErrorCode::AlreadyExists,
            "version_mismatch" => ErrorCode::VersionMismatch,
            "execution_failed" => ErrorCode::ExecutionFailed,
            "timeout" => ErrorCode::Timeout,
            "canceled" => ErrorCode::Canceled,
            "parse_failed" => ErrorCode::ParseFailed,
            "invalid_operation" => ErrorCode::InvalidOperation,
            "auth_failed" => ErrorCode::AuthFailed,
            "rate_limited" => ErrorCode::RateLimited,
            "network_error" => ErrorCode::NetworkError,
            "sync_conflict" => ErrorCode::SyncConflict,
            "invalid_data" => ErrorCode::InvalidData,
            "config_error" => ErrorCode::ConfigError,
            "provider_error" => ErrorCode::ProviderError,
            _ => {
                return Err(ZenError::new(
                    ErrorCode::ParseFailed,
                    format!("unknown error code '{s}'"),
                ))
            }
        };
        Ok(code)
    }
}

// ---------------------------------------------------------------------------
// ZenError
// ---------------------------------------------------------------------------

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error shared by every `zen` crate.
///
/// Renders as `[provider:op:code] message: cause`. Segments that were never
/// set render empty.
#[derive(Debug, Error)]
#[error(
    "[{}:{}:{code}] {message}{}",
    .provider.as_deref().unwrap_or(""),
    .operation.as_deref().unwrap_or(""),
    cause_suffix(.source)
)]
pub struct ZenError {
    pub code: ErrorCode,
    pub message: String,
    pub provider: Option<String>,
    pub operation: Option<String>,
    pub task_id: Option<String>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub hint: Option<String>,
    #[source]
    source: Option<BoxError>,
}

fn cause_suffix(source: &Option<BoxError>) -> String {
    source
        .as_ref()
        .map(|cause| format!(": {cause}"))
        .unwrap_or_default()
}

impl ZenError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            operation: None,
            task_id: None,
            retryable: code.is_retryable(),
            timestamp: Utc::now(),
            hint: None,
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidData, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidOperation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderError, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Code equality. Message text is never consulted.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

impl From<std::io::Error> for ZenError {
    fn from(e: std::io::Error) -> Self {
        ZenError::new(ErrorCode::ExecutionFailed, "I/O error").with_source(e)
    }
}

impl From<serde_json::Error> for ZenError {
    fn from(e: serde_json::Error) -> Self {
        ZenError::parse("invalid JSON").with_source(e)
    }
}

impl From<serde_yaml::Error> for ZenError {
    fn from(e: serde_yaml::Error) -> Self {
        ZenError::parse("invalid YAML").with_source(e)
    }
}

pub type Result<T> = std::result::Result<T, ZenError>;
