//! Error handling for the SMA-X client
//!
//! This module defines the error kinds surfaced by the pipeline, the lazy
//! cache and the notification registry, and a Result alias used throughout
//! the crate.

use thiserror::Error;

/// Main error type for SMA-X client operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmaxError {
    /// The outbound queue is at capacity and the caller asked not to block
    #[error("Queue full: {limit} requests already pending")]
    QueueFull { limit: usize },

    /// A wait, flush or sync point deadline passed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The transport dropped while the request was outstanding
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The underlying command execution failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Pull of a variable that does not exist in the store
    #[error("Variable not found: {0}")]
    NotFound(String),

    /// A reply payload could not be interpreted
    #[error("Decode error: {0}")]
    Decode(String),

    /// Malformed table or variable name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// A blocked wait was released explicitly
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SmaxError>,
    },
}

impl SmaxError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SmaxError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed
    pub fn root(&self) -> &SmaxError {
        match self {
            SmaxError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the same operation may succeed if tried again later.
    ///
    /// `QueueFull` and `Timeout` leave the underlying request (if any) alive;
    /// everything else is a permanent outcome for that request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            SmaxError::QueueFull { .. } | SmaxError::Timeout(_)
        )
    }

    /// Check whether this error reports a lost connection
    pub fn is_connection_lost(&self) -> bool {
        matches!(self.root(), SmaxError::ConnectionLost(_))
    }
}

impl From<std::io::Error> for SmaxError {
    fn from(err: std::io::Error) -> Self {
        SmaxError::Io(err.to_string())
    }
}

/// Result type alias for SMA-X client operations
pub type Result<T> = std::result::Result<T, SmaxError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
