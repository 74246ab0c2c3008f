//! Error Handling Module
//!
//! A single crate-wide error type covering provider failures, validation,
//! capacity and lifecycle errors. The server layer maps variants to HTTP
//! status codes; the runner consults [`LacquerError::is_retryable`] to decide
//! whether a failed step attempt may be retried.

use serde::{Deserialize, Serialize};

/// A single input validation failure.
///
/// Collected (never short-circuited) by the input validator and returned to
/// clients verbatim in the `details` array of a 400 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the offending input field.
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
    /// The offending value, echoed back when one was provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors produced anywhere in the workflow execution core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LacquerError {
    /// Upstream API returned an error response. 4xx codes are passed through
    /// unchanged; 5xx codes are considered transient.
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Network-level failure talking to an upstream service.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A request or operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Failed to parse a response or data file.
    #[error("parse error: {0}")]
    Parse(String),

    /// A workflow file failed to deserialize.
    #[error("invalid workflow definition: {0}")]
    Yaml(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Bad or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No API key could be resolved for a provider.
    #[error("api key required for provider '{provider}' (set it in the config or one of {tried:?})")]
    MissingApiKey { provider: String, tried: Vec<String> },

    /// No provider registered under the requested name.
    #[error("unknown provider: {0}")]
    ProviderNotFound(String),

    /// No workflow loaded under the requested id.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No execution known under the requested run id.
    #[error("execution not found: {0}")]
    RunNotFound(String),

    /// All concurrency slots are occupied.
    #[error("server at capacity ({active}/{max} executions running)")]
    AtCapacity { active: usize, max: usize },

    /// One or more workflow inputs failed validation.
    #[error("input validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    /// Expression evaluation or template interpolation failed.
    #[error("expression error: {0}")]
    Expression(String),

    /// The step dependency graph contains a cycle.
    #[error("dependency cycle involving step '{0}'")]
    CycleDetected(String),

    /// A step exhausted its attempts and the run was aborted.
    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// The run's cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,

    /// A provider subprocess failed.
    #[error("subprocess error: {0}")]
    Process(String),

    /// Invariant violation or caught panic.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation is not supported by this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl LacquerError {
    /// Shorthand for an upstream API error without structured details.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a step attempt that failed with this error may be retried.
    ///
    /// Transient failures are network errors, timeouts, 429s and 5xx
    /// responses. Client errors, validation failures and cancellation are
    /// final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// Whether this error is the run-cancellation marker.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for LacquerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for LacquerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LacquerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for LacquerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LacquerError::Http("connection reset".into()).is_retryable());
        assert!(LacquerError::Timeout("deadline".into()).is_retryable());
        assert!(LacquerError::api(500, "server error").is_retryable());
        assert!(LacquerError::api(429, "rate limited").is_retryable());

        assert!(!LacquerError::api(400, "bad request").is_retryable());
        assert!(!LacquerError::api(404, "not found").is_retryable());
        assert!(!LacquerError::Cancelled.is_retryable());
        assert!(!LacquerError::Validation(vec![]).is_retryable());
    }

    #[test]
    fn test_cancellation_marker() {
        let err = LacquerError::Cancelled;
        assert!(err.is_cancellation());
        assert!(err.to_string().starts_with("execution cancelled"));
    }

    #[test]
    fn test_field_error_serialization() {
        let err = FieldError::new("age", "less than minimum").with_value(serde_json::json!(3));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["field"], "age");
        assert_eq!(json["value"], 3);

        let bare = FieldError::new("name", "required field is missing");
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("value").is_none());
    }
}
