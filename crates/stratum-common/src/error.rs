use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by a downstream instance, either from a call or a health probe.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct DownstreamError {
    /// Optional machine-readable error code supplied by the transport
    pub code: Option<String>,
    pub message: String,
}

impl DownstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StratumError {
    /// The breaker refused the call without attempting it.
    #[error("Circuit open for {breaker}")]
    CircuitOpen { breaker: String },

    #[error("Call through {breaker} timed out after {timeout_ms}ms")]
    Timeout { breaker: String, timeout_ms: u64 },

    /// A business error the breaker was configured to pass through untouched.
    #[error(transparent)]
    Downstream(DownstreamError),

    #[error("Call through {breaker} failed: {source}")]
    CallFailed {
        breaker: String,
        #[source]
        source: DownstreamError,
    },

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Unknown instance {id} of service {service}")]
    UnknownInstance { service: String, id: String },

    #[error("No instance available for service {service}")]
    NoInstanceAvailable { service: String },

    #[error("No transport configured")]
    NoTransport,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StratumError {
    /// True when the error means "do not retry this instance right now".
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, StratumError::CircuitOpen { .. })
    }

    /// True for failures the breaker counted against the instance.
    pub fn is_instance_failure(&self) -> bool {
        matches!(
            self,
            StratumError::Timeout { .. } | StratumError::CallFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StratumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_display() {
        let err = StratumError::CircuitOpen {
            breaker: "orders/orders-1".to_string(),
        };
        assert_eq!(err.to_string(), "Circuit open for orders/orders-1");
        assert!(err.is_circuit_open());
        assert!(!err.is_instance_failure());
    }

    #[test]
    fn test_downstream_is_transparent() {
        let err = StratumError::Downstream(DownstreamError::with_code("404", "not found"));
        assert_eq!(err.to_string(), "not found");
        assert!(!err.is_instance_failure());
    }

    #[test]
    fn test_call_failed_keeps_source() {
        use std::error::Error as _;

        let err = StratumError::CallFailed {
            breaker: "b".to_string(),
            source: DownstreamError::new("connection reset"),
        };
        assert!(err.is_instance_failure());
        assert_eq!(err.source().map(|s| s.to_string()), Some("connection reset".to_string()));
    }
}
