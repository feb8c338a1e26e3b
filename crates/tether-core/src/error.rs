//! Error types for Tether Core

use thiserror::Error;

use crate::session::SessionStatus;

/// Result type alias using Tether Error
pub type Result<T> = std::result::Result<T, Error>;

/// Tether error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session ID: {0}")]
    InvalidSessionId(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Maximum sessions ({0}) reached")]
    MaxSessionsReached(usize),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors caused by an unknown or malformed session id
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SessionNotFound(_) | Error::InvalidSessionId(_))
    }
}

/// Tool-specific errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Rejected by user: {0}")]
    Rejected(String),
}
