//! Error types for the fleetops operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Optimistic-concurrency conflict (resource version mismatch, or the
    /// Provider refusing to remove a runner that picked up a new job)
    Conflict(String),
    /// Provider API error (5xx, network, malformed response)
    Provider(String),
    /// Provider rate limit hit
    RateLimited(String),
    /// Resource not found (cluster-side or Provider-side)
    NotFound(String),
    /// Invalid user-supplied spec; never retried
    Validation(String),
    /// Configuration error
    Configuration(String),
    /// Serialization error
    Serialization(String),
    /// Invalid resource state
    InvalidState(String),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            OperatorError::Provider(msg) => write!(f, "Provider API error: {}", msg),
            OperatorError::RateLimited(msg) => write!(f, "Provider rate limit: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::Validation(msg) => write!(f, "Validation error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(err.to_string()),
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(err.to_string()),
            _ => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for OperatorError {
    fn from(err: reqwest::Error) -> Self {
        OperatorError::Provider(err.to_string())
    }
}

impl OperatorError {
    /// Whether a retry can reasonably succeed without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeApi(_)
                | OperatorError::Conflict(_)
                | OperatorError::Provider(_)
                | OperatorError::RateLimited(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            OperatorError::KubeApi("api".to_string()),
            OperatorError::Conflict("conflict".to_string()),
            OperatorError::Provider("provider".to_string()),
            OperatorError::RateLimited("rate".to_string()),
            OperatorError::NotFound("resource".to_string()),
            OperatorError::Validation("bad spec".to_string()),
            OperatorError::Configuration("config".to_string()),
            OperatorError::Serialization("serde".to_string()),
            OperatorError::InvalidState("state".to_string()),
        ];

        for err in errors {
            // Ensure Display is implemented
            let _ = format!("{}", err);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(OperatorError::Provider("x".into()).is_transient());
        assert!(OperatorError::Conflict("x".into()).is_transient());
        assert!(!OperatorError::Validation("x".into()).is_transient());
        assert!(!OperatorError::NotFound("x".into()).is_transient());
    }
}
