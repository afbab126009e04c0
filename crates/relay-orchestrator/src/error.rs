//! Error types for the orchestrator crate.

use thiserror::Error;

/// Result type alias using the orchestrator error type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error type for orchestrator operations.
///
/// Per-task tool failures are not errors at this level; they are recorded in
/// the run's ledger and shown to the model. Only configuration problems and
/// failed LLM calls abort a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid per-call configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An LLM call failed.
    #[error("LLM error: {0}")]
    Llm(#[from] relay_llm::LlmError),
}

impl OrchestratorError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::config("system prompt template is blank");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("blank"));
    }

    #[test]
    fn test_llm_error_conversion() {
        let err: OrchestratorError = relay_llm::LlmError::DeadlineExceeded.into();
        assert!(matches!(err, OrchestratorError::Llm(_)));
    }
}
