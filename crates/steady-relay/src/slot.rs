//! Per-policy slot state: an ordered block sequence with bounded size.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::trace;

use steady_core::{BlockHeader, Policy, BLOCK_HEADER_WIRE_SIZE};

/// A block as stored at the relay: the decoded header, its exact wire
/// form for replay to readers, and the opaque payload.
#[derive(Debug, Clone)]
pub(crate) struct StoredBlock {
    pub header: BlockHeader,
    pub header_wire: [u8; BLOCK_HEADER_WIRE_SIZE],
    pub payload: Bytes,
}

/// The state held for one policy: its blocks in index order, the running
/// byte total, and the next index a write must carry.
#[derive(Debug)]
pub(crate) struct Slot {
    pub policy: Policy,
    pub blocks: VecDeque<StoredBlock>,
    pub space: u64,
    pub next_index: u64,
}

impl Slot {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            blocks: VecDeque::new(),
            space: 0,
            next_index: 0,
        }
    }

    /// Append a block and evict from the front until the byte total is
    /// within the policy's space again.
    pub fn store(&mut self, block: StoredBlock) {
        self.space += block.header.len_cur;
        self.next_index = block.header.index + 1;
        self.blocks.push_back(block);

        while self.space > self.policy.space {
            match self.blocks.pop_front() {
                Some(old) => {
                    trace!(index = old.header.index, "evicted old block to make room");
                    self.space -= old.header.len_cur;
                }
                None => break,
            }
        }
    }

    /// Number of stored blocks with index at or above `start`.
    pub fn count_from(&self, start: u64) -> u64 {
        self.blocks
            .iter()
            .rev()
            .take_while(|b| b.header.index >= start)
            .count() as u64
    }
}
