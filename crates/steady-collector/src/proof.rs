//! Third-party verification of event origin.

use steady_core::{khash, root_from_audit_path, Ed25519PublicKey, HASH_SIZE};

use crate::assessment::{BlockHead, Proof};

/// Check that `event` really was logged by the device behind `vk`.
///
/// The check needs nothing private: the proof and block head come out of
/// an assessment, the verification key is public. It rebuilds the
/// Merkle root from the audit path, re-keys it with the block IV
/// against the signed root hash, and verifies the device's signature
/// over the header hash, root hash, and time.
pub fn verify_event_origin(
    event: &[u8],
    proof: &Proof,
    head: &BlockHead,
    vk: &Ed25519PublicKey,
) -> bool {
    if proof.block_id != head.block_id {
        return false;
    }

    let root = root_from_audit_path(
        event,
        proof.event_index as usize,
        head.tree_size as usize,
        &proof.path,
    );
    if !khash(head.iv.as_bytes(), &[root.as_bytes()]).ct_eq(&head.root_hash) {
        return false;
    }

    let mut message = [0u8; 2 * HASH_SIZE + 8];
    message[..HASH_SIZE].copy_from_slice(head.header_hash.as_bytes());
    message[HASH_SIZE..2 * HASH_SIZE].copy_from_slice(head.root_hash.as_bytes());
    message[2 * HASH_SIZE..].copy_from_slice(&head.time.to_be_bytes());
    vk.verify(&message, &head.signature).is_ok()
}
