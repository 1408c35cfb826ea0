//! Error types for provider calls.

use pflow_core::tool::ToolError;
use reqwest::StatusCode;
use thiserror::Error;
use tooling::logging::sanitize_for_logging;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when calling a provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure (connect, reset, body read).
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// 401/403 from the provider.
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// Unknown model or deployment.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// 5xx from the provider.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// The provider rejected the request body.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A response or stream event did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    /// The connection cannot be turned into a client configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl LlmError {
    /// Map a non-success HTTP status and its body to an error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("{}: {}", status, body.trim());
        match status.as_u16() {
            401 | 403 => LlmError::AuthenticationError(message),
            404 => LlmError::ModelNotFound(message),
            408 => LlmError::Timeout(message),
            429 => LlmError::RateLimitExceeded(message),
            400 | 422 => LlmError::InvalidRequest(message),
            500..=599 => LlmError::ServiceUnavailable(message),
            _ => LlmError::ProviderError(message),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::HttpError(e) => !e.is_builder() && !e.is_decode(),
            LlmError::ServiceUnavailable(_)
            | LlmError::Timeout(_)
            | LlmError::RateLimitExceeded(_) => true,
            _ => false,
        }
    }

    /// Check if this error is due to authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, LlmError::AuthenticationError(_))
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::SerializationError(err.to_string())
    }
}

/// Provider errors reach the flow engine as tool errors; retryable ones become
/// [`ToolError::Transient`] so the LLM retry wrapper picks them up.
impl From<LlmError> for ToolError {
    fn from(err: LlmError) -> Self {
        let message = sanitize_for_logging(&err.to_string());
        if err.is_retryable() {
            ToolError::Transient(message)
        } else {
            ToolError::Execution(message)
        }
    }
}
