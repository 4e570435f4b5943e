//! Gateway Sentinel error types

use thiserror::Error;

/// Gateway Sentinel error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected gateway endpoint
    #[error("Invalid gateway endpoint: {0}")]
    InvalidEndpoint(String),

    /// Health check filter names no known check
    #[error("Unknown check name: {0}")]
    UnknownCheck(String),

    /// Transport-level fault (refused, closed, policy violation)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Handshake rejected by the gateway
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Request issued before the handshake was acknowledged
    #[error("Gateway session not ready")]
    SessionNotReady,

    /// No response within the request timeout
    #[error("Request timeout")]
    RequestTimeout,

    /// Gateway answered a tool call with an error
    #[error("Tool call failed: {0}")]
    ToolCall(String),

    /// Pending request dropped without a response
    #[error("Request cancelled")]
    Cancelled,

    /// Malformed wire message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Gateway Sentinel operations
pub type Result<T> = std::result::Result<T, Error>;
