use thiserror::Error;

/// Error taxonomy shared by every cache component.
///
/// Tier-level failures (`Timeout`, `Backend`) are absorbed by the coordinator
/// and turned into degraded results; only `Unavailable` is expected to reach
/// application callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Operation '{operation}' timed out after {budget_ms}ms")]
    Timeout {
        operation: &'static str,
        budget_ms: u64,
    },

    #[error("Local tier capacity exceeded: entry needs {requested} bytes, budget is {budget} bytes")]
    CapacityExceeded { requested: u64, budget: u64 },

    #[error("Partial failure: {succeeded} succeeded, {failed} failed")]
    PartialFailure { succeeded: u64, failed: u64 },

    #[error("Backend error on node {node}: {message}")]
    Backend { node: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn timeout(operation: &'static str, budget: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            budget_ms: budget.as_millis() as u64,
        }
    }

    pub fn backend(node: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Backend {
            node: node.into(),
            message: message.to_string(),
        }
    }

    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization(message.to_string())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Transient errors are retried on the caller's own schedule.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend { .. })
    }

    /// Check if this error is a client error (4xx category)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Conflict(_) | Self::InvalidRequest(_)
        )
    }

    /// Check if this error is a server error (5xx category)
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable(_) => ErrorCategory::Unavailable,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::CapacityExceeded { .. } => ErrorCategory::Capacity,
            Self::PartialFailure { .. } => ErrorCategory::Partial,
            Self::Backend { .. } => ErrorCategory::Backend,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::NotFound(_) | Self::Conflict(_) | Self::InvalidRequest(_) => {
                ErrorCategory::Validation
            }
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Unavailable,
    Timeout,
    Capacity,
    Partial,
    Backend,
    Serialization,
    Configuration,
    Validation,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Capacity => write!(f, "capacity"),
            Self::Partial => write!(f, "partial"),
            Self::Backend => write!(f, "backend"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
