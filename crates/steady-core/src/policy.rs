//! Policy: the signed binding of a device identity to a relay slot.
//!
//! A policy ties a random 32-byte identifier to the device's verification
//! key, its encryption public key, and the retention parameters the relay
//! must honor. Policies are immutable and self-authenticating: decoding
//! verifies the embedded signature against the embedded verification key.

use rand::RngCore;
use std::fmt;

use crate::crypto::{
    khash, Blake2Hash, Ed25519PublicKey, Ed25519Signature, Keypair, X25519PublicKey,
    SIGNATURE_SIZE, VERIFICATION_KEY_SIZE, X25519_KEY_SIZE,
};
use crate::error::CoreError;

/// Policy identifier length in bytes.
pub const POLICY_ID_SIZE: usize = 32;

/// Encoded policy length on the wire:
/// id, vk, pub, timeout, space, time, signature.
pub const POLICY_WIRE_SIZE: usize =
    POLICY_ID_SIZE + VERIFICATION_KEY_SIZE + X25519_KEY_SIZE + 3 * 8 + SIGNATURE_SIZE;

/// A random 32-byte policy identifier.
///
/// The identifier doubles as the key for the keyed digests in block
/// headers, binding every block to its policy.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyId(pub [u8; POLICY_ID_SIZE]);

impl PolicyId {
    /// Draw a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; POLICY_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; POLICY_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; POLICY_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for PolicyId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Retention parameters for a new policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyParams {
    /// Maximum seconds between blocks from the device.
    pub timeout: u64,
    /// Maximum retained bytes at the relay.
    pub space: u64,
    /// Creation instant, seconds since the Unix epoch.
    pub time: u64,
}

/// A signed policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Random identifier of this device/relay slot.
    pub id: PolicyId,
    /// The device's verification key.
    pub vk: Ed25519PublicKey,
    /// The device's encryption public key.
    pub encrypt_key: X25519PublicKey,
    /// Maximum seconds between blocks.
    pub timeout: u64,
    /// Maximum retained bytes at the relay.
    pub space: u64,
    /// Creation instant, seconds since the Unix epoch.
    pub time: u64,
    /// Signature over all preceding fields under the device's signing key.
    pub signature: Ed25519Signature,
}

impl Policy {
    /// Create a new policy with a fresh random identifier, signed by
    /// `keypair`.
    pub fn create(keypair: &Keypair, encrypt_key: X25519PublicKey, params: PolicyParams) -> Self {
        let mut policy = Policy {
            id: PolicyId::random(),
            vk: keypair.public_key(),
            encrypt_key,
            timeout: params.timeout,
            space: params.space,
            time: params.time,
            signature: Ed25519Signature::from_bytes([0u8; SIGNATURE_SIZE]),
        };
        let mut unsigned = Vec::with_capacity(POLICY_WIRE_SIZE - SIGNATURE_SIZE);
        policy.encode_unsigned(&mut unsigned);
        policy.signature = keypair.sign(&unsigned);
        policy
    }

    fn encode_unsigned(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(self.vk.as_bytes());
        buf.extend_from_slice(self.encrypt_key.as_bytes());
        buf.extend_from_slice(&self.timeout.to_be_bytes());
        buf.extend_from_slice(&self.space.to_be_bytes());
        buf.extend_from_slice(&self.time.to_be_bytes());
    }

    /// Encode to the fixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(POLICY_WIRE_SIZE);
        self.encode_unsigned(&mut buf);
        buf.extend_from_slice(self.signature.as_bytes());
        buf
    }

    /// Decode from the wire, verifying the embedded signature against the
    /// embedded verification key.
    ///
    /// A decoded policy is self-consistent; whether the verification key
    /// is trusted remains the caller's decision.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != POLICY_WIRE_SIZE {
            return Err(CoreError::PolicyLength {
                expected: POLICY_WIRE_SIZE,
                got: bytes.len(),
            });
        }

        let signed = &bytes[..POLICY_WIRE_SIZE - SIGNATURE_SIZE];
        let mut vk_bytes = [0u8; VERIFICATION_KEY_SIZE];
        vk_bytes.copy_from_slice(&bytes[POLICY_ID_SIZE..POLICY_ID_SIZE + VERIFICATION_KEY_SIZE]);
        let vk = Ed25519PublicKey::from_bytes(vk_bytes);

        let mut sig_bytes = [0u8; SIGNATURE_SIZE];
        sig_bytes.copy_from_slice(&bytes[POLICY_WIRE_SIZE - SIGNATURE_SIZE..]);
        let signature = Ed25519Signature::from_bytes(sig_bytes);

        vk.verify(signed, &signature)?;

        let mut id = [0u8; POLICY_ID_SIZE];
        id.copy_from_slice(&bytes[..POLICY_ID_SIZE]);
        let mut offset = POLICY_ID_SIZE + VERIFICATION_KEY_SIZE;
        let mut encrypt_key = [0u8; X25519_KEY_SIZE];
        encrypt_key.copy_from_slice(&bytes[offset..offset + X25519_KEY_SIZE]);
        offset += X25519_KEY_SIZE;

        let u64_at = |o: usize| {
            let mut tmp = [0u8; 8];
            tmp.copy_from_slice(&bytes[o..o + 8]);
            u64::from_be_bytes(tmp)
        };
        let timeout = u64_at(offset);
        let space = u64_at(offset + 8);
        let time = u64_at(offset + 16);

        Ok(Policy {
            id: PolicyId::from_bytes(id),
            vk,
            encrypt_key: X25519PublicKey::from_bytes(encrypt_key),
            timeout,
            space,
            time,
            signature,
        })
    }

    /// Keyed digest under this policy's identifier.
    pub fn keyed_digest(&self, parts: &[&[u8]]) -> Blake2Hash {
        khash(self.id.as_bytes(), parts)
    }
}
