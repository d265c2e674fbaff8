//! Assessment and proof types: the collector's publicly shareable
//! verdict on one poll, and the material a third party needs to verify
//! an event's origin.

use serde::Serialize;
use std::collections::BTreeMap;

use bytes::Bytes;

use steady_core::{Blake2Hash, Ed25519Signature, Iv};

/// The overall colour of an assessment, worst finding wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    /// Everything checked out.
    Ok,
    /// Unclear who is misbehaving, possibly nobody.
    Warning,
    /// The relay (or the network) is provably misbehaving.
    Evil,
}

impl Overall {
    /// The wire label for this colour.
    pub fn as_str(&self) -> &'static str {
        match self {
            Overall::Ok => "ok",
            Overall::Warning => "warning",
            Overall::Evil => "evil",
        }
    }
}

/// One finding inside an assessment.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub label: Overall,
    pub description: String,
}

/// The signed head of a verified block, kept so that any event from the
/// block can later be proven to a third party.
#[derive(Debug, Clone, Serialize)]
pub struct BlockHead {
    /// The block index.
    pub block_id: u64,
    /// Keyed digest of the wire payload.
    pub payload_hash: Blake2Hash,
    /// Keyed digest of the header fields; part of the signed message.
    pub header_hash: Blake2Hash,
    /// The IV-keyed Merkle root from the header.
    pub root_hash: Blake2Hash,
    /// The plain Merkle root over the decrypted events.
    pub root: Blake2Hash,
    /// The block IV that re-keys the root.
    pub iv: Iv,
    /// The device's signature over header hash, root hash, and time.
    pub signature: Ed25519Signature,
    /// Block time from the header.
    pub time: u64,
    /// Number of events in the block.
    pub tree_size: u64,
}

/// Membership proof for one verified event: the audit path to the root
/// of its block, plus the block and assessment it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct Proof {
    /// The assessment that carries the matching [`BlockHead`].
    pub assessment_id: u64,
    /// The block the event came from.
    pub block_id: u64,
    /// Position of the event in its block.
    pub event_index: u64,
    /// RFC 6962 audit path from the event to the block root.
    pub path: Vec<Blake2Hash>,
}

/// Metadata attached to events that could not be verified.
#[derive(Debug, Clone, Serialize)]
pub struct Unverified {
    pub assessment_id: u64,
    pub description: String,
}

/// The collector's verdict for one poll.
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    /// Identifier linking every event emitted by this poll.
    pub id: u64,
    /// The overall colour.
    pub overall: Overall,
    /// All findings behind the overall colour.
    pub findings: Vec<Finding>,

    /// Address of the queried relay.
    pub relay: String,
    /// Local time of the poll, seconds since the Unix epoch.
    pub time: u64,
    /// The start index sent in the read request.
    pub request_index: u64,

    /// Blocks returned in total; valid + invalid + duplicate.
    pub total_blocks: u64,
    /// Blocks with a valid signature and a new index.
    pub valid_blocks: u64,
    /// Blocks with an old index.
    pub invalid_blocks: u64,
    /// Blocks repeating an index already seen in this poll.
    pub duplicate_blocks: u64,
    /// Blocks established as missing (gaps, overwrites, decode losses).
    pub missed_blocks: u64,

    /// The signed head of every verified block, by index. Together with
    /// a [`Proof`] and the device's verification key this is a publicly
    /// checkable proof of event origin.
    pub block_heads: BTreeMap<u64, BlockHead>,
}

impl Assessment {
    pub(crate) fn push_finding(&mut self, label: Overall, description: String) {
        self.findings.push(Finding { label, description });
    }

    /// Fold the findings into the overall colour: green if none, red if
    /// any red finding, yellow otherwise.
    pub(crate) fn fold_overall(&mut self) {
        self.overall = if self.findings.is_empty() {
            Overall::Ok
        } else if self.findings.iter().any(|f| f.label == Overall::Evil) {
            Overall::Evil
        } else {
            Overall::Warning
        };
    }
}

/// One output of the collector loop.
///
/// `Verified` events carry a proof of origin; everything else is
/// best-effort data or reporting.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// An event from a verified block, with its membership proof.
    Verified { data: Bytes, proof: Proof },
    /// An event (or raw payload) from a valid block that failed to
    /// decode end-to-end.
    Unverified { data: Bytes, meta: Unverified },
    /// An event (or raw payload) from a block with an outdated index.
    Invalid { data: Bytes, meta: Unverified },
    /// An event (or raw payload) from a duplicated block.
    Duplicate { data: Bytes, meta: Unverified },
    /// A failed poll or other non-fatal trouble.
    Warning { message: String },
    /// The full verdict for the poll, emitted last.
    Assessment(Box<Assessment>),
}

impl CollectorEvent {
    /// The stable label for this kind of output.
    pub fn label(&self) -> &'static str {
        match self {
            CollectorEvent::Verified { .. } => "verified",
            CollectorEvent::Unverified { .. } => "unverified",
            CollectorEvent::Invalid { .. } => "invalid",
            CollectorEvent::Duplicate { .. } => "duplicate",
            CollectorEvent::Warning { .. } => "warning",
            CollectorEvent::Assessment(_) => "assessment",
        }
    }
}
