//! Error types for LLM operations.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Error type for LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request could not be sent or the connection failed.
    #[error("request error: {0}")]
    Request(String),

    /// The API returned a non-success status.
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error body or message.
        message: String,
    },

    /// The streaming response broke mid-flight.
    #[error("stream error: {0}")]
    Stream(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The response carried no completion choices.
    #[error("no completion choices returned")]
    EmptyResponse,

    /// The request deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl LlmError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a request error.
    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    /// Create a stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

/// Whether an error is worth retrying.
///
/// Connection failures and throttling/server statuses are transient;
/// everything else is not.
pub fn is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Request(_) => true,
        LlmError::Api { status, .. } => *status == 429 || (500..=599).contains(status),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LlmError::Api {
            status: 429,
            message: "rate limited".to_string(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&LlmError::request("connection reset")));
        assert!(is_retryable(&LlmError::Api {
            status: 429,
            message: String::new()
        }));
        assert!(is_retryable(&LlmError::Api {
            status: 503,
            message: String::new()
        }));

        assert!(!is_retryable(&LlmError::Api {
            status: 400,
            message: String::new()
        }));
        assert!(!is_retryable(&LlmError::config("missing key")));
        assert!(!is_retryable(&LlmError::DeadlineExceeded));
    }
}
