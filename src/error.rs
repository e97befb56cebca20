//! Error types for agent-relay
//!
//! One tagged union covers the whole error taxonomy. Authentication and
//! rate-limit errors are normally recovered inside the driver (credential
//! fallback, model retry) and only surface once every option is exhausted;
//! everything else propagates straight to the caller.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    /// Missing/empty required field, unknown model, invalid reference
    #[error("Validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Credential rejected; carries one line per attempted credential
    #[error("Authentication failed after {} attempt(s): {}", attempts.len(), attempts.join("; "))]
    Authentication { attempts: Vec<String> },

    /// Worker CLI reported a quota or rate-limit signal
    #[error("Rate limited on model `{model}`: {message}")]
    RateLimit { model: String, message: String },

    /// Worker CLI rejected the model itself (treated like a rate limit for fallback)
    #[error("Model `{model}` unavailable: {message}")]
    ModelUnavailable { model: String, message: String },

    /// Deadline expired and the child was terminated
    #[error("Operation `{operation}` timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Caller cancelled an in-flight execution
    #[error("Operation `{operation}` was cancelled")]
    Cancelled { operation: String },

    /// Spawn failure or unclassified non-zero exit
    #[error("Worker process error: {0}")]
    Process(String),

    /// Artifact persistence or context-file read failure
    #[error("Filesystem error at `{path}`: {message}")]
    Filesystem { path: String, message: String },

    /// Unknown session id, illegal transition, or resume without an external id
    #[error("Session `{id}`: {message}")]
    Session { id: String, message: String },

    /// Conversation or cost budget exceeded
    #[error("Budget exceeded ({kind}): {message}")]
    Budget { kind: String, message: String },

    /// Required setting missing or malformed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// HTTP request error (marketplace aggregator)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create an authentication error from the list of failed attempts
    pub fn authentication(attempts: Vec<String>) -> Self {
        Error::Authentication { attempts }
    }

    /// Create a new rate-limit error
    pub fn rate_limit(model: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::RateLimit {
            model: model.into(),
            message: msg.into(),
        }
    }

    /// Create a new model-unavailable error
    pub fn model_unavailable(model: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::ModelUnavailable {
            model: model.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Error::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Error::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a new process error
    pub fn process(msg: impl Into<String>) -> Self {
        Error::Process(msg.into())
    }

    /// Create a new filesystem error
    pub fn filesystem(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Filesystem {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a new session error
    pub fn session(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Session {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a new budget error
    pub fn budget(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Budget {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Stable kind code for logging and host-side dispatch
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Authentication { .. } => "authentication",
            Error::RateLimit { .. } => "rate_limit",
            Error::ModelUnavailable { .. } => "model_unavailable",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::Process(_) => "process",
            Error::Filesystem { .. } => "filesystem",
            Error::Session { .. } => "session",
            Error::Budget { .. } => "budget",
            Error::Config(_) => "config",
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
        }
    }

    /// True for errors the driver may recover from by switching model or credential
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RateLimit { .. } | Error::ModelUnavailable { .. } | Error::Authentication { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = Error::validation("task", "must not be empty");
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(
            err.to_string(),
            "Validation failed for `task`: must not be empty"
        );
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_authentication_enumerates_attempts() {
        let err = Error::authentication(vec![
            "oauth: unauthenticated".to_string(),
            "api-key: invalid key".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("2 attempt(s)"));
        assert!(text.contains("oauth: unauthenticated"));
        assert!(text.contains("api-key: invalid key"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("execute", 120);
        assert_eq!(err.to_string(), "Operation `execute` timed out after 120s");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_cancelled_display() {
        let err = Error::cancelled("execute");
        assert_eq!(err.to_string(), "Operation `execute` was cancelled");
    }

    #[test]
    fn test_budget_display() {
        let err = Error::budget("conversation_tokens", "would exceed 32000 tokens");
        assert!(matches!(err, Error::Budget { .. }));
        assert_eq!(err.kind(), "budget");
    }

    #[test]
    fn test_session_display() {
        let err = Error::session("sess-1", "no external id captured, cannot resume");
        assert_eq!(
            err.to_string(),
            "Session `sess-1`: no external id captured, cannot resume"
        );
    }

    #[test]
    fn test_recoverable_partition() {
        assert!(Error::rate_limit("gemini-2.5-pro", "quota").is_recoverable());
        assert!(Error::model_unavailable("gemini-2.5-pro", "not found").is_recoverable());
        assert!(Error::authentication(vec![]).is_recoverable());
        assert!(!Error::timeout("execute", 5).is_recoverable());
        assert!(!Error::config("missing").is_recoverable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(err.kind(), "json");
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::cancelled("noop"))
        }
    }
}
