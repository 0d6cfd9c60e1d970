use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy shared by the agent HTTP surface, relay responses and the
/// bridge gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unauthorized,
    PermissionDenied,
    NotFound,
    InvalidRequest,
    Timeout,
    Busy,
    AgentUnavailable,
    ShuttingDown,
    ExecutionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::NotFound => "not-found",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Busy => "busy",
            ErrorCode::AgentUnavailable => "agent-unavailable",
            ErrorCode::ShuttingDown => "shutting-down",
            ErrorCode::ExecutionFailed => "execution-failed",
        }
    }

    /// HTTP status used when this error crosses an HTTP boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::Timeout => 504,
            ErrorCode::Busy => 429,
            ErrorCode::AgentUnavailable => 503,
            ErrorCode::ShuttingDown => 503,
            ErrorCode::ExecutionFailed => 500,
        }
    }

    /// Conditions after which nothing else will succeed on this agent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCode::ShuttingDown)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {} ({})", self.code, self.message, reason),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ErrorBody {}
