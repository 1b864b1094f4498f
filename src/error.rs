//! Error types for the remote transfer client.
//!
//! Validation errors are raised before any network I/O. Protocol, transfer and
//! connection errors surface from an active session.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Transport-level failure. Cloneable so one fault can be handed to every
/// request still waiting on the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("validation failed ({check}): {message}")]
    Validation {
        check: &'static str,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid sequence: {0}")]
    InvalidSequence(&'static str),
}

impl ProviderError {
    pub fn validation(check: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            check,
            message: message.into(),
        }
    }

    /// Classify the `error` member of a server response.
    ///
    /// An object carrying a `message` is a native failure, a bare string is a
    /// string-coded failure, anything else is unknown.
    pub fn from_remote(error: &serde_json::Value) -> Self {
        match error {
            serde_json::Value::Object(map) => match map.get("message") {
                Some(serde_json::Value::String(message)) => Self::Transfer(message.clone()),
                _ => Self::Transfer("Unexpected error".to_string()),
            },
            serde_json::Value::String(message) => Self::Transfer(message.clone()),
            _ => Self::Transfer("Unexpected error".to_string()),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_error_classification() {
        assert_eq!(
            ProviderError::from_remote(&json!({ "message": "bad step" })),
            ProviderError::Transfer("bad step".to_string())
        );
        assert_eq!(
            ProviderError::from_remote(&json!("quota exceeded")),
            ProviderError::Transfer("quota exceeded".to_string())
        );
        assert_eq!(
            ProviderError::from_remote(&json!(42)),
            ProviderError::Transfer("Unexpected error".to_string())
        );
        assert_eq!(
            ProviderError::from_remote(&json!({ "code": 7 })),
            ProviderError::Transfer("Unexpected error".to_string())
        );
    }

    #[test]
    fn test_connection_error_converts() {
        let err: ProviderError = ConnectionError::Closed.into();
        assert_eq!(err, ProviderError::Connection(ConnectionError::Closed));
        assert_eq!(err.to_string(), "connection closed");
    }

    #[test]
    fn test_validation_display() {
        let err = ProviderError::validation("url", "Invalid protocol \"ftp:\"");
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "validation failed (url): Invalid protocol \"ftp:\""
        );
    }
}
