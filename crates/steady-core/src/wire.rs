//! Wire protocol constants shared by the relay, device, and collector.
//!
//! All integers on the wire are big-endian. Every session starts a
//! command with a two-byte prefix: the protocol version and the command
//! byte.

use crate::crypto::{khash, Blake2Hash, HASH_SIZE};

/// Protocol version byte. Peers reject anything newer.
pub const WIRE_VERSION: u8 = 0x42;

/// Wire flag for true.
pub const FLAG_TRUE: u8 = 0x01;

/// Wire flag for false.
pub const FLAG_FALSE: u8 = 0x00;

/// Status reply flag: a block header follows.
pub const FLAG_MORE: u8 = 0x0A;

/// Reply flag for a failed authentication check.
pub const FLAG_AUTH_ERR: u8 = 0x0F;

/// Length of an authentication tag on the wire.
pub const AUTH_TAG_SIZE: usize = HASH_SIZE;

/// Authentication label for the setup command.
pub const LABEL_SETUP: &[u8] = b"setup";

/// Authentication label for single-block write replies.
pub const LABEL_WRITE: &[u8] = b"write";

/// Authentication label for batched write replies.
pub const LABEL_WRITE_N: &[u8] = b"writeN";

/// Authentication label for the status command.
pub const LABEL_STATUS: &[u8] = b"status";

/// The commands a relay session understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Query the latest block header for a policy (token-authenticated).
    Status = 0x00,
    /// Register a new policy (token-authenticated).
    Setup = 0x01,
    /// Download blocks from a start index (public).
    Read = 0x02,
    /// Append a single block (authenticated by the reply).
    Write = 0x03,
    /// Append a batch of blocks, all-or-nothing.
    WriteN = 0x04,
}

impl Command {
    /// Parse a command byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Status),
            0x01 => Some(Self::Setup),
            0x02 => Some(Self::Read),
            0x03 => Some(Self::Write),
            0x04 => Some(Self::WriteN),
            _ => None,
        }
    }

    /// The wire byte for this command.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Compute the keyed authentication tag for a command: the shared token
/// keys a digest over the command label and the given parts.
pub fn auth_tag(token: &str, label: &[u8], parts: &[&[u8]]) -> Blake2Hash {
    let mut input: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
    input.push(label);
    input.extend_from_slice(parts);
    khash(token.as_bytes(), &input)
}
