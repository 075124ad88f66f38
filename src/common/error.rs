//! Error types for kvpipe

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// External dependency a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Cache,
    Queue,
    Store,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Cache => write!(f, "cache"),
            Component::Queue => write!(f, "queue"),
            Component::Store => write!(f, "store"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === Caller Errors ===
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    // === Dependency Errors ===
    #[error("{component} unavailable: {reason}")]
    DependencyUnavailable { component: Component, reason: String },

    #[error("{component} timed out after {millis}ms")]
    DependencyTimeout { component: Component, millis: u64 },

    // === Queue Errors ===
    #[error("Poison message: {0}")]
    PoisonMessage(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),

    #[error("Queue journal error: {0}")]
    Journal(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unavailable(component: Component, reason: impl fmt::Display) -> Self {
        Error::DependencyUnavailable {
            component,
            reason: reason.to_string(),
        }
    }

    /// The dependency this error is attributed to, if any
    pub fn component(&self) -> Option<Component> {
        match self {
            Error::DependencyUnavailable { component, .. }
            | Error::DependencyTimeout { component, .. } => Some(*component),
            Error::RocksDb(_) => Some(Component::Store),
            Error::Journal(_) | Error::UnknownDelivery(_) => Some(Component::Queue),
            _ => None,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DependencyUnavailable { .. }
                | Error::DependencyTimeout { .. }
                | Error::RocksDb(_)
                | Error::Io(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DependencyUnavailable { .. } | Error::DependencyTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::Validation("key required".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("k".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::unavailable(Component::Queue, "down").to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Internal("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_component_attribution() {
        let err = Error::DependencyTimeout {
            component: Component::Store,
            millis: 250,
        };
        assert_eq!(err.component(), Some(Component::Store));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "store timed out after 250ms");

        assert_eq!(Error::Validation("x".into()).component(), None);
        assert!(!Error::Validation("x".into()).is_retryable());
    }
}
