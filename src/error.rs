/// Unified error handling for the puente connection pool
///
/// Covers the full error taxonomy of the pool: selection failures
/// (no healthy endpoint), exhausted retry budgets, acquisition timeouts,
/// statement execution failures reported by the driver, and operations
/// attempted after shutdown.
use thiserror::Error;

/// Main error type for pool operations
#[derive(Debug, Error)]
pub enum PuenteError {
    /// No endpoint is currently Healthy or Degraded
    #[error("no healthy endpoints available")]
    NoHealthyEndpoints,

    /// The retry budget was spent without a successful acquisition
    #[error("all endpoints exhausted after {attempts} attempts: {last_error}")]
    AllEndpointsExhausted { attempts: u32, last_error: String },

    /// A per-endpoint pool stayed at capacity beyond the acquire timeout
    #[error("timed out acquiring connection to endpoint {endpoint} after {waited_ms}ms")]
    AcquireTimeout { endpoint: String, waited_ms: u64 },

    /// Driver-reported failure while executing a statement
    #[error("query execution failed on {endpoint}: {message}")]
    QueryExecution { endpoint: String, message: String },

    /// Operation attempted after Shutdown()
    #[error("pool is closed")]
    PoolClosed,

    /// Failure opening a physical connection to an endpoint
    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unknown endpoint identifier passed to a preferred-endpoint acquisition
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Internal errors (should not happen in normal operation)
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for pool operations
pub type PuenteResult<T> = Result<T, PuenteError>;

impl PuenteError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(endpoint: S, message: S) -> Self {
        PuenteError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a query execution error
    pub fn query<S: Into<String>>(endpoint: S, message: S) -> Self {
        PuenteError::QueryExecution {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PuenteError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by retrying against another endpoint
    ///
    /// Statement-level failures are not recoverable: retrying a logically
    /// failed statement on a different endpoint is incorrect.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PuenteError::Connection { .. } => true,
            PuenteError::AcquireTimeout { .. } => true,
            PuenteError::QueryExecution { .. } => false,
            PuenteError::PoolClosed => false,
            PuenteError::Config(_) => false,
            _ => false,
        }
    }

    /// Get error severity level for logging and monitoring
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PuenteError::Config(_) => ErrorSeverity::Critical,
            PuenteError::Internal { .. } => ErrorSeverity::Critical,
            PuenteError::AllEndpointsExhausted { .. } => ErrorSeverity::Error,
            PuenteError::NoHealthyEndpoints => ErrorSeverity::Error,
            PuenteError::Connection { .. } => ErrorSeverity::Warning,
            PuenteError::AcquireTimeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
