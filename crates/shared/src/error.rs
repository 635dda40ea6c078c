use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable code carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    Malformed,
    Validation,
    Internal,
}

/// Why a command was rejected. All of these are local to one connection:
/// the command is refused, an `error` event is sent back, and the socket
/// stays open with shared state untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// The connection has not completed the auth handshake.
    #[error("{0}")]
    AuthenticationRequired(String),
    /// The connection's role does not permit the command.
    #[error("{0}")]
    AuthorizationViolation(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("{0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::AuthenticationRequired(_) => ErrorCode::Unauthorized,
            CommandError::AuthorizationViolation(_) => ErrorCode::Forbidden,
            CommandError::MalformedMessage(_) => ErrorCode::Malformed,
            CommandError::Validation(_) => ErrorCode::Validation,
            CommandError::Internal(_) => ErrorCode::Internal,
        }
    }
}
