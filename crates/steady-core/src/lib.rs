//! # Steady Core
//!
//! Pure primitives for the Steady tamper-evident append log: crypto,
//! policies, the block codec, and RFC 6962 Merkle hashing.
//!
//! This crate contains no I/O and no networking. The relay, device, and
//! collector crates build their wire traffic from the codecs here.
//!
//! ## Key Types
//!
//! - [`Policy`] - Signed binding of a device identity to a relay slot
//! - [`BlockHeader`] - The fixed 192-byte header of an append unit
//! - [`Blake2Hash`] - 32-byte BLAKE2b-256 digest (plain or keyed)
//! - [`Keypair`] - Ed25519 signing identity of a device
//!
//! ## Integrity model
//!
//! Every block header carries a keyed digest (under the policy
//! identifier) of its fields and a signature over that digest, the
//! IV-keyed Merkle root, and the block time. A relay can therefore
//! neither forge blocks nor silently reorder them.

pub mod block;
pub mod crypto;
pub mod error;
pub mod merkle;
pub mod policy;
pub mod wire;

pub use block::{
    check_payload_hash, decode_block_payload, encode_block, BlockHeader, Iv,
    BLOCK_HEADER_WIRE_SIZE, IV_SIZE, MAX_BLOCK_SIZE, MAX_EVENT_SIZE,
};
pub use crypto::{
    compress, decompress, decrypt, encrypt, encrypt_keygen, hash, khash, Blake2Hash,
    Ed25519PublicKey, Ed25519Signature, Keypair, X25519PublicKey, X25519SecretKey, HASH_SIZE,
    SIGNATURE_SIZE, SIGNING_KEY_SIZE, VERIFICATION_KEY_SIZE, X25519_KEY_SIZE,
};
pub use error::CoreError;
pub use merkle::{audit_path, merkle_tree_hash, root_from_audit_path};
pub use policy::{Policy, PolicyId, PolicyParams, POLICY_ID_SIZE, POLICY_WIRE_SIZE};
pub use wire::{auth_tag, Command, AUTH_TAG_SIZE, WIRE_VERSION};
