//! Error types for the device logger.

use std::path::PathBuf;
use thiserror::Error;

use steady_core::CoreError;

/// Errors from provisioning, loading, or driving a device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("device file already exists at {0}")]
    ConfigExists(PathBuf),

    #[error("device file too small, expected at least {expected} bytes, got {got}")]
    ConfigTooSmall { expected: usize, got: usize },

    #[error("relay did not accept the setup, wrong relay or token?")]
    SetupRejected,

    #[error("device is not registered at the relay")]
    NotRegistered,

    #[error("relay rejected the authentication token")]
    AuthRejected,

    #[error("unexpected status reply byte {0:#04x}")]
    UnexpectedReply(u8),

    #[error("relay has no blocks but local state expects index {next_index}, possible rollback")]
    RelayEmptyRollback { next_index: u64 },

    #[error("relay head index {relay} is behind local state {local}, possible rollback")]
    RelayBehind { relay: u64, local: u64 },

    #[error("event too large, max {max}, got {got}")]
    EventTooLarge { max: usize, got: usize },

    #[error("device is closed")]
    Closed,

    #[error("logging task failed: {0}")]
    Task(String),
}
