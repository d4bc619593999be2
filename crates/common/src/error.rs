//! Common error types for GenLoop
//!
//! This module defines all error types used across the node. Admission and
//! transport errors are consumed inside the control loop (logged and
//! counted); only startup errors are allowed to be fatal.

use thiserror::Error;

/// Main error type for GenLoop
#[derive(Error, Debug)]
pub enum NodeError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport errors (connect, send, receive)
    #[error("transport error: {0}")]
    Transport(String),

    /// Tokenizer errors
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Step engine errors
    #[error("step engine error: {0}")]
    Engine(String),

    /// Request refused at admission (budget exceeded, empty prompt)
    #[error("admission rejected: {0}")]
    Admission(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        NodeError::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        NodeError::Transport(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        NodeError::Tokenizer(msg.into())
    }

    /// Create a step engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        NodeError::Engine(msg.into())
    }

    /// Create an admission error
    pub fn admission(msg: impl Into<String>) -> Self {
        NodeError::Admission(msg.into())
    }
}

/// Result type alias for GenLoop operations
pub type Result<T> = std::result::Result<T, NodeError>;
