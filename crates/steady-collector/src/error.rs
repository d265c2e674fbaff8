//! Error types for the collector.

use thiserror::Error;

use steady_core::CoreError;

/// Errors from the collector.
///
/// A failed poll is never fatal to the loop: it is reported as a warning
/// event and the next tick starts over with a fresh connection. Only a
/// closed output channel stops the loop with an error.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("collector file too small, expected at least {expected} bytes, got {got}")]
    ConfigTooSmall { expected: usize, got: usize },

    #[error("event output channel closed")]
    OutputClosed,
}
