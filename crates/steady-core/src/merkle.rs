//! RFC 6962 Merkle tree hashing and audit paths.
//!
//! Leaves and interior nodes are domain-separated with a prefix byte.
//! The tree hash is computed with an iterative level fold so stack usage
//! stays bounded for large event lists; audit path construction recurses
//! on the split point, which is at most log2(n) deep.

use crate::crypto::{hash, Blake2Hash};

/// Domain separation prefix for leaf hashes.
pub const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix for interior node hashes.
pub const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(leaf: &[u8]) -> Blake2Hash {
    hash(&[&[LEAF_PREFIX], leaf])
}

fn node_hash(left: &[u8], right: &[u8]) -> Blake2Hash {
    hash(&[&[NODE_PREFIX], left, right])
}

/// The largest power of two strictly smaller than `n` (i.e. k < n <= 2k).
/// Requires `n >= 2`.
fn split_point(n: usize) -> usize {
    1 << (n - 1).ilog2()
}

/// Merkle tree hash over the given leaves, per RFC 6962 section 2.1.
///
/// `MTH({}) = HASH()`, `MTH({d}) = HASH(0x00 || d)`, and for larger
/// lists the tree splits at the largest power of two below the length.
pub fn merkle_tree_hash<T: AsRef<[u8]>>(leaves: &[T]) -> Blake2Hash {
    match leaves.len() {
        0 => hash(&[]),
        1 => leaf_hash(leaves[0].as_ref()),
        _ => {
            // Level-by-level fold; an unpaired node is promoted unchanged,
            // which yields the same left-balanced tree as the recursive
            // split-point definition.
            let mut level: Vec<Blake2Hash> =
                leaves.iter().map(|l| leaf_hash(l.as_ref())).collect();
            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len().div_ceil(2));
                let mut pairs = level.chunks_exact(2);
                for pair in &mut pairs {
                    next.push(node_hash(pair[0].as_ref(), pair[1].as_ref()));
                }
                if let [odd] = pairs.remainder() {
                    next.push(*odd);
                }
                level = next;
            }
            level[0]
        }
    }
}

/// Audit path for leaf `m` of the given leaves, per RFC 6962
/// section 2.1.1. Empty for lists of one or fewer leaves.
pub fn audit_path<T: AsRef<[u8]>>(m: usize, leaves: &[T]) -> Vec<Blake2Hash> {
    let mut path = Vec::new();
    collect_path(m, leaves, &mut path);
    path
}

fn collect_path<T: AsRef<[u8]>>(m: usize, leaves: &[T], out: &mut Vec<Blake2Hash>) {
    if leaves.len() <= 1 {
        return;
    }
    let k = split_point(leaves.len());
    if m < k {
        collect_path(m, &leaves[..k], out);
        out.push(merkle_tree_hash(&leaves[k..]));
    } else {
        collect_path(m - k, &leaves[k..], out);
        out.push(merkle_tree_hash(&leaves[..k]));
    }
}

/// Reconstruct the expected root for `leaf` at `index` in a tree of
/// `size` leaves from an audit path.
///
/// A path that is too short produces a root that simply fails to match;
/// callers compare the result against the signed root.
pub fn root_from_audit_path(
    leaf: &[u8],
    index: usize,
    size: usize,
    path: &[Blake2Hash],
) -> Blake2Hash {
    let mut root = leaf_hash(leaf);
    let mut path = path.iter();
    let mut index = index;
    let mut last_index = size.saturating_sub(1);
    while last_index > 0 {
        if index % 2 == 1 {
            let sibling = path.next().map(|h| h.as_ref()).unwrap_or(&[]);
            root = node_hash(sibling, root.as_ref());
        } else if index < last_index {
            let sibling = path.next().map(|h| h.as_ref()).unwrap_or(&[]);
            root = node_hash(root.as_ref(), sibling);
        }
        index /= 2;
        last_index /= 2;
    }
    root
}
