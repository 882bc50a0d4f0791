use std::fmt;

use serde_json::{json, Value};

/// Numeric error codes surfaced to the peer in error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoMessage = 411,
    InvalidJson = 412,
    InvalidElement = 413,
    InvalidUrlId = 414,
    /// Internal failures without a dedicated peer-facing code.
    Internal = 500,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone)]
pub struct PluginError {
    pub code: ErrorCode,
    pub reason: String,
}

impl PluginError {
    pub fn new(code: ErrorCode, reason: impl ToString) -> Self {
        PluginError {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_element(field: &str) -> Self {
        PluginError::new(
            ErrorCode::InvalidElement,
            format!("invalid element ({})", field),
        )
    }

    pub fn internal(reason: impl ToString) -> Self {
        PluginError::new(ErrorCode::Internal, reason)
    }

    /// Renders the error-event body pushed back to the peer.
    pub fn event(&self) -> Value {
        json!({
            "source": "event",
            "error_code": self.code.code(),
            "error": self.reason,
        })
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.reason)
    }
}

impl std::error::Error for PluginError {}
