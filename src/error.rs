//! Error types for the limiter.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The admission check that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Instantaneous concurrency ceiling
    Concurrent,
    /// Token-bucket rate ceiling
    Rate,
    /// Fixed-window request ceiling
    Request,
}

impl Dimension {
    /// Stable lowercase name, used in logs and metric names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Concurrent => "concurrent",
            Dimension::Rate => "rate",
            Dimension::Request => "request",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A ceiling was exceeded and the call was throttled
    #[error("Rejected by {dimension} limit: {identity}")]
    Rejected {
        identity: String,
        dimension: Dimension,
    },

    /// The check itself could not be evaluated (store or transport failure)
    #[error("Failed to evaluate {dimension} limit for {identity}: {reason}")]
    CheckFailed {
        identity: String,
        dimension: Dimension,
        reason: String,
    },

    /// No limiter is registered under the identity
    #[error("Limiter not found: {0}")]
    ConfigNotFound(String),

    /// A refresh was attempted with a config for a different limiter
    #[error("Identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// No limiter implementation is registered for a mode
    #[error("No limiter implementation registered for mode: {0}")]
    ExtensionNotFound(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(String),

    /// A store round trip exceeded its timeout
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML rule file errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (wire format) errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),
}

impl LimiterError {
    /// Whether this error is an expected throttling decision.
    pub fn is_rejected(&self) -> bool {
        matches!(self, LimiterError::Rejected { .. })
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LimiterError {
    fn from(e: redis::RedisError) -> Self {
        LimiterError::Store(e.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
