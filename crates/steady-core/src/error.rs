//! Error types for the Steady core.

use thiserror::Error;

/// Errors from the pure codec and crypto layer.
///
/// Every failure here is permanent for the input that caused it: a block or
/// policy that fails to decode will keep failing, and callers classify it
/// rather than retry it.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signing key material")]
    InvalidSigningKey,

    #[error("event too large, max {max}, got {got}")]
    EventTooLarge { max: usize, got: usize },

    #[error("invalid encoded policy length, expected {expected}, got {got}")]
    PolicyLength { expected: usize, got: usize },

    #[error("block header too short, expected {expected}, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("invalid header hash")]
    HeaderHashMismatch,

    #[error("header length field below the fixed header size")]
    HeaderLengthUnderflow,

    #[error("invalid payload length, expected {expected}, got {got}")]
    PayloadLength { expected: u64, got: u64 },

    #[error("invalid payload hash")]
    PayloadHashMismatch,

    #[error("payload too short to carry an IV")]
    TruncatedPayload,

    #[error("invalid encoded events")]
    MalformedEvents,

    #[error("ciphertext too short")]
    ShortCiphertext,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),
}
