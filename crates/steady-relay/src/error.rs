//! Error types for the relay.

use thiserror::Error;

use steady_core::CoreError;

/// Errors that end a relay session.
///
/// Handlers never reply with error details; a session that misbehaves is
/// logged and closed, and clients recover by reconnecting.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invalid authentication tag")]
    AuthFailed,

    #[error("unknown policy {0}")]
    UnknownPolicy(String),

    #[error("wrong block index, expected {expected}, got {got}")]
    WrongIndex { expected: u64, got: u64 },

    #[error("block too large, max {max}, got {got}")]
    BlockTooLarge { max: u64, got: u64 },

    #[error("block larger than the policy's retained space")]
    ExceedsPolicySpace,

    #[error("invalid payload hash")]
    PayloadHashMismatch,
}
