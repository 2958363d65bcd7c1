use thiserror::Error;

use crate::model::Phase;

/// Unified error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed task payload pulled off a queue.
    #[error("malformed task payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// The backing store could not be reached or answered with a
    /// transport-level failure. Recoverable through the retry chain.
    #[error("store unavailable during {operation}: {source}")]
    StoreTransient {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Compare-and-set observed a different value than expected.
    /// Losing this race is normal under duplicate delivery.
    #[error("compare-and-set conflict on key {key}")]
    StoreMismatch { key: String },

    /// A key that should exist was absent.
    #[error("key {key} not found")]
    StoreNotFound { key: String },

    /// A stored value could not be interpreted (e.g. a counter that is
    /// not an integer).
    #[error("corrupt value under key {key}")]
    StoreCorrupt { key: String },

    /// A user node function returned an error. Terminal for the request.
    #[error("node {node} failed: {reason}")]
    NodeFailed { node: String, reason: String },

    /// The requested flow has no registered definition.
    #[error("flow {0} is not registered")]
    FlowNotFound(String),

    /// A definition failed validation (cycle, unknown edge endpoint, ...).
    #[error("invalid flow definition: {0}")]
    InvalidFlow(String),

    /// The operation is inconsistent with the request's current phase.
    #[error("request {request} is {phase}, cannot {operation}")]
    PhaseConflict {
        request: String,
        phase: Phase,
        operation: &'static str,
    },

    /// Queue fabric failure (publish, consume wiring, ack/push).
    #[error("queue {queue} failed during {operation}: {reason}")]
    Queue {
        queue: String,
        operation: &'static str,
        reason: String,
    },

    /// Worker-mode operation attempted while not consuming.
    #[error("runtime is not in worker mode")]
    NotInWorkerMode,

    /// Queue connection was never initialized. Fatal at startup.
    #[error("queue connection not initialized")]
    ConnectionUninitialized,

    /// Invalid engine configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Catch-all for internal invariant violations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn store<S, E>(operation: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreTransient {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn queue<S: Into<String>>(queue: S, operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Queue {
            queue: queue.into(),
            operation,
            reason: reason.into(),
        }
    }

    /// True when the error indicates a CAS race that a concurrent
    /// delivery already won.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::StoreMismatch { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StoreNotFound { .. })
    }

    /// True when a retry hop through the push chain may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreTransient { .. } | Self::Queue { .. })
    }

    /// Error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::StoreTransient { .. } => "store_transient",
            Self::StoreMismatch { .. } => "store_mismatch",
            Self::StoreNotFound { .. } => "store_not_found",
            Self::StoreCorrupt { .. } => "store_corrupt",
            Self::NodeFailed { .. } => "node_failed",
            Self::FlowNotFound(_) => "flow_not_found",
            Self::InvalidFlow(_) => "invalid_flow",
            Self::PhaseConflict { .. } => "phase_conflict",
            Self::Queue { .. } => "queue",
            Self::NotInWorkerMode => "not_in_worker_mode",
            Self::ConnectionUninitialized => "connection_uninitialized",
            Self::Configuration(_) => "configuration",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        Self::store("redis", err)
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_is_not_transient() {
        let err = EngineError::StoreMismatch { key: "state-a".into() };
        assert!(err.is_mismatch());
        assert!(!err.is_transient());
        assert_eq!(err.category(), "store_mismatch");
    }

    #[test]
    fn parse_error_converts() {
        let err: EngineError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.category(), "parse");
    }
}
