//! Error types for Burrow
//!
//! This module defines the error type shared by configuration loading and the
//! proxy edge, with a focus on clear failure modes and operational visibility.
//! Layer-specific errors (tunnel negotiation, upstream connections) live next
//! to the code that raises them and convert into [`BurrowError`] at the edge.

use thiserror::Error;

/// Main error type for Burrow operations
#[derive(Error, Debug)]
pub enum BurrowError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Upstream connection errors
    #[error("Upstream error: {cluster} - {message}")]
    Upstream {
        cluster: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Request validation errors
    #[error("Request validation failed: {reason}")]
    RequestValidation { reason: String },

    /// Timeout errors
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// TLS/Certificate errors
    #[error("TLS error: {message}")]
    Tls {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<String>,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for Burrow operations
pub type BurrowResult<T> = Result<T, BurrowError>;

impl BurrowError {
    /// Get the HTTP status code for this error
    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Config { .. } => 500,
            Self::Upstream { .. } => 502,
            Self::RequestValidation { .. } => 400,
            Self::Timeout { .. } => 504,
            Self::Tls { .. } => 502,
            Self::Io { .. } => 500,
        }
    }

    /// Get a client-safe error message (without internal details)
    pub fn client_message(&self) -> String {
        match self {
            Self::Config { .. } => "Internal server error".to_string(),
            Self::Upstream { .. } => "Bad gateway".to_string(),
            Self::RequestValidation { reason } => format!("Bad request: {}", reason),
            Self::Timeout { .. } => "Gateway timeout".to_string(),
            Self::Tls { .. } => "Bad gateway".to_string(),
            Self::Io { .. } => "Internal server error".to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create an upstream error carrying its cause
    pub fn upstream(
        cluster: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Upstream {
            cluster: cluster.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }
}

/// Helper for converting IO errors
impl From<std::io::Error> for BurrowError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            path: None,
            source: err,
        }
    }
}
