//! Common error types for CoreLoop
//!
//! This module defines all error types used across the CoreLoop workspace.
//! Failures are never retried automatically; each variant is surfaced either to
//! the caller of a fallible operation or to the completion callback of a request.

use std::num::ParseIntError;
use thiserror::Error;

/// Main error type for CoreLoop
#[derive(Error, Debug)]
pub enum CoreLoopError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model compilation failed (not retried)
    #[error("Compilation failure: {0}")]
    Compilation(String),

    /// Loading a compiled artifact onto a core failed (fatal to that worker)
    #[error("Load failure: {0}")]
    Load(String),

    /// Inference failed for a single request (the worker keeps running)
    #[error("Inference failure: {0}")]
    Inference(String),

    /// Submission after the dispatcher was stopped
    #[error("Queue closed: dispatcher is no longer accepting requests")]
    QueueClosed,

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Artifact encoding/decoding errors
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Tensor operation errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ParseIntError> for CoreLoopError {
    fn from(err: ParseIntError) -> Self {
        CoreLoopError::Parse(err.to_string())
    }
}

impl From<::config::ConfigError> for CoreLoopError {
    fn from(err: ::config::ConfigError) -> Self {
        CoreLoopError::Config(err.to_string())
    }
}

impl CoreLoopError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        CoreLoopError::Config(msg.into())
    }

    /// Create a compilation error
    pub fn compilation(msg: impl Into<String>) -> Self {
        CoreLoopError::Compilation(msg.into())
    }

    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        CoreLoopError::Load(msg.into())
    }

    /// Create an inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        CoreLoopError::Inference(msg.into())
    }

    /// Create an artifact error
    pub fn artifact(msg: impl Into<String>) -> Self {
        CoreLoopError::Artifact(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        CoreLoopError::Tensor(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        CoreLoopError::InvalidInput(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        CoreLoopError::QueueFull(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        CoreLoopError::Internal(msg.into())
    }

    /// Short, stable label for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            CoreLoopError::Config(_) => "config",
            CoreLoopError::Compilation(_) => "compilation",
            CoreLoopError::Load(_) => "load",
            CoreLoopError::Inference(_) => "inference",
            CoreLoopError::QueueClosed => "queue_closed",
            CoreLoopError::QueueFull(_) => "queue_full",
            CoreLoopError::Artifact(_) => "artifact",
            CoreLoopError::Tensor(_) => "tensor",
            CoreLoopError::InvalidInput(_) => "invalid_input",
            CoreLoopError::Serialization(_) => "serialization",
            CoreLoopError::Yaml(_) => "yaml",
            CoreLoopError::Io(_) => "io",
            CoreLoopError::Parse(_) => "parse",
            CoreLoopError::Internal(_) => "internal",
        }
    }

    /// Whether the error only affects one request rather than the dispatcher
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            CoreLoopError::Inference(_) | CoreLoopError::Tensor(_) | CoreLoopError::InvalidInput(_)
        )
    }
}

/// Result type alias for CoreLoop operations
pub type Result<T> = std::result::Result<T, CoreLoopError>;
