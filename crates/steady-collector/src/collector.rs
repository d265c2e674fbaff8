//! The collector loop: poll, classify, assess, emit.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use steady_core::{
    audit_path, decode_block_payload, merkle_tree_hash, BlockHeader, Command,
    BLOCK_HEADER_WIRE_SIZE, WIRE_VERSION,
};

use crate::assessment::{
    Assessment, BlockHead, CollectorEvent, Overall, Proof, Unverified,
};
use crate::config::CollectorConfig;
use crate::error::CollectorError;

/// The position a collector resumes from: the next index it expects and
/// the time of the last block it verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct State {
    pub index: u64,
    pub time: u64,
}

/// A block as returned by the relay, header verified.
struct FetchedBlock {
    header: BlockHeader,
    payload: Bytes,
}

/// Which best-effort bucket a block landed in.
#[derive(Clone, Copy)]
enum BestEffort {
    Unverified,
    Invalid,
    Duplicate,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn assessment_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// A Steady collector bound to one relay and one policy.
pub struct Collector {
    address: String,
    conn: Option<TcpStream>,
    frequency: Duration,
    delta: u64,
    config: CollectorConfig,
    state: State,
}

impl Collector {
    /// Connect to a relay. The connection is re-established per poll if
    /// it drops later.
    pub async fn connect(
        address: impl Into<String>,
        config: CollectorConfig,
        frequency: Duration,
        delta: u64,
    ) -> Result<Self, CollectorError> {
        let address = address.into();
        let conn = TcpStream::connect(&address).await?;
        Ok(Self {
            address,
            conn: Some(conn),
            frequency,
            delta,
            config,
            state: State::default(),
        })
    }

    /// The state after the most recent poll.
    pub fn state(&self) -> State {
        self.state
    }

    /// Poll every `frequency` until `cancel` resolves, emitting events
    /// and one [`Assessment`] per poll on `out`.
    ///
    /// A failed poll becomes a warning event and the loop continues;
    /// only a closed output channel ends the loop early.
    pub async fn collect_loop(
        &mut self,
        state: State,
        mut cancel: mpsc::Receiver<()>,
        out: mpsc::Sender<CollectorEvent>,
    ) -> Result<(), CollectorError> {
        self.state = state;
        let mut ticker = interval_at(Instant::now() + self.frequency, self.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.recv() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.poll(&out).await?;
        }
    }

    async fn poll(&mut self, out: &mpsc::Sender<CollectorEvent>) -> Result<(), CollectorError> {
        let request_index = self.state.index;
        let blocks = match self.read_from_relay().await {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(%err, "poll failed");
                // Drop the connection so the next tick redials.
                self.conn = None;
                send(out, CollectorEvent::Warning {
                    message: err.to_string(),
                })
                .await?;
                return Ok(());
            }
        };

        let (valid, invalid, duplicate) = self.group(blocks);
        let missed = valid
            .first()
            .map(|b| b.header.index - self.state.index)
            .unwrap_or(0);

        let mut assessment = Assessment {
            id: assessment_id(),
            overall: Overall::Ok,
            findings: Vec::new(),
            relay: self.address.clone(),
            time: now_unix(),
            request_index,
            total_blocks: (valid.len() + invalid.len() + duplicate.len()) as u64,
            valid_blocks: valid.len() as u64,
            invalid_blocks: invalid.len() as u64,
            duplicate_blocks: duplicate.len() as u64,
            missed_blocks: missed,
            block_heads: BTreeMap::new(),
        };

        self.assess(&valid, &mut assessment);

        let advance = valid.last().map(|b| (b.header.index, b.header.time));
        let remaining = self.output_valid(valid, out, &mut assessment).await?;
        if !remaining.is_empty() {
            assessment.push_finding(
                Overall::Evil,
                format!(
                    "Got {} remaining valid blocks that failed to be output",
                    remaining.len()
                ),
            );
            assessment.overall = Overall::Evil;
        }

        self.output_best_effort(remaining, BestEffort::Unverified, out, &assessment)
            .await?;
        self.output_best_effort(invalid, BestEffort::Invalid, out, &assessment)
            .await?;
        self.output_best_effort(duplicate, BestEffort::Duplicate, out, &assessment)
            .await?;
        debug!(
            overall = assessment.overall.as_str(),
            valid = assessment.valid_blocks,
            "poll assessed"
        );
        send(out, CollectorEvent::Assessment(Box::new(assessment))).await?;

        // Only verified-index blocks move the cursor forward.
        if let Some((index, time)) = advance {
            self.state.index = index + 1;
            self.state.time = time;
        }
        Ok(())
    }

    async fn read_from_relay(&mut self) -> Result<Vec<FetchedBlock>, CollectorError> {
        if self.conn.is_none() {
            self.conn = Some(TcpStream::connect(&self.address).await?);
        }
        let conn = self.conn.as_mut().expect("connection was just ensured");

        conn.write_all(&[WIRE_VERSION, Command::Read.as_u8()]).await?;
        conn.write_all(self.config.policy.id.as_bytes()).await?;
        conn.write_all(&self.state.index.to_be_bytes()).await?;

        let mut count_buf = [0u8; 8];
        conn.read_exact(&mut count_buf).await?;
        let count = u64::from_be_bytes(count_buf);

        let mut blocks = Vec::new();
        for _ in 0..count {
            let mut header_wire = [0u8; BLOCK_HEADER_WIRE_SIZE];
            conn.read_exact(&mut header_wire).await?;
            let header = BlockHeader::decode(&header_wire, &self.config.policy)?;
            let mut payload = vec![0u8; header.payload_len() as usize];
            conn.read_exact(&mut payload).await?;
            blocks.push(FetchedBlock {
                header,
                payload: Bytes::from(payload),
            });
        }
        Ok(blocks)
    }

    /// Sort by index and split into the first occurrence of each new
    /// index (valid), first occurrences of already-consumed indices
    /// (invalid), and repeats within this poll (duplicate).
    fn group(
        &self,
        mut blocks: Vec<FetchedBlock>,
    ) -> (Vec<FetchedBlock>, Vec<FetchedBlock>, Vec<FetchedBlock>) {
        blocks.sort_by_key(|b| b.header.index);

        let mut valid = Vec::with_capacity(blocks.len());
        let mut invalid = Vec::new();
        let mut duplicate = Vec::new();
        let mut seen = HashSet::new();
        for block in blocks {
            if !seen.insert(block.header.index) {
                duplicate.push(block);
            } else if block.header.index >= self.state.index {
                valid.push(block);
            } else {
                invalid.push(block);
            }
        }
        (valid, invalid, duplicate)
    }

    /// Derive findings. Three shapes are possible: nothing returned, a
    /// contiguous continuation, or a continuation that starts past the
    /// cursor. The last one means blocks are gone and gets the deletion
    /// checks.
    fn assess(&self, valid: &[FetchedBlock], a: &mut Assessment) {
        match valid.first() {
            None => self.check_timely(self.state.time, a),
            Some(first) => {
                let last = valid.last().expect("valid is non-empty");
                self.check_timely(last.header.time, a);
                self.check_sequence(valid, a);
                if first.header.index != self.state.index {
                    self.check_size(valid, a);
                    a.push_finding(
                        Overall::Warning,
                        format!(
                            "{} blocks overwritten since last read {} seconds ago. Reasonable? Relay space {} bytes.",
                            a.missed_blocks,
                            a.time.saturating_sub(self.state.time),
                            self.config.policy.space
                        ),
                    );
                }
            }
        }

        if a.duplicate_blocks > 0 {
            a.push_finding(
                Overall::Evil,
                format!("Got {} duplicate blocks from relay.", a.duplicate_blocks),
            );
        }
        if a.invalid_blocks > 0 {
            a.push_finding(
                Overall::Evil,
                format!(
                    "Got {} invalid (old index and/or invalid signature) blocks from relay.",
                    a.invalid_blocks
                ),
            );
        }
        a.fold_overall();
    }

    fn check_timely(&self, then: u64, a: &mut Assessment) {
        let delay = a.time.saturating_sub(then);
        if delay > self.config.policy.timeout + self.delta {
            a.push_finding(
                Overall::Warning,
                format!(
                    "Block(s) delayed by {} seconds (policy timeout {}, delta {}).",
                    delay, self.config.policy.timeout, self.delta
                ),
            );
        }
    }

    fn check_sequence(&self, valid: &[FetchedBlock], a: &mut Assessment) {
        for pair in valid.windows(2) {
            if pair[1].header.index != pair[0].header.index + 1 {
                a.push_finding(
                    Overall::Evil,
                    format!("Expected block with index {}.", pair[0].header.index + 1),
                );
                a.missed_blocks += 1;
            }
        }
    }

    /// Deletion check: if what came back plus the predecessor it claims
    /// would still have fit in the policy's space, the relay had room
    /// for the missing blocks and chose not to keep them.
    fn check_size(&self, valid: &[FetchedBlock], a: &mut Assessment) {
        let size: u64 = valid.iter().map(|b| b.header.len_cur).sum();
        if size + valid[0].header.len_prev <= self.config.policy.space {
            a.push_finding(
                Overall::Evil,
                format!(
                    "Relay only returned {} bytes of valid blocks (policy space {})",
                    size, self.config.policy.space
                ),
            );
        }
    }

    /// Decrypt and emit every event of every valid block with its audit
    /// path. Blocks that fail to decode are returned for best-effort
    /// output and counted as missed.
    async fn output_valid(
        &self,
        valid: Vec<FetchedBlock>,
        out: &mpsc::Sender<CollectorEvent>,
        a: &mut Assessment,
    ) -> Result<Vec<FetchedBlock>, CollectorError> {
        let mut remaining = Vec::new();
        for block in valid {
            let (events, iv) = match decode_block_payload(
                &block.payload,
                &self.config.pub_key,
                &self.config.priv_key,
                &self.config.policy,
                &block.header,
            ) {
                Ok(decoded) => decoded,
                Err(err) => {
                    debug!(index = block.header.index, %err, "valid block failed to decode");
                    a.missed_blocks += 1;
                    remaining.push(block);
                    continue;
                }
            };

            a.block_heads.insert(
                block.header.index,
                BlockHead {
                    block_id: block.header.index,
                    payload_hash: block.header.payload_hash,
                    header_hash: block.header.header_hash,
                    root_hash: block.header.root_hash,
                    root: merkle_tree_hash(&events),
                    iv,
                    signature: block.header.signature,
                    time: block.header.time,
                    tree_size: events.len() as u64,
                },
            );

            for (j, event) in events.iter().enumerate() {
                send(out, CollectorEvent::Verified {
                    data: event.clone(),
                    proof: Proof {
                        assessment_id: a.id,
                        block_id: block.header.index,
                        event_index: j as u64,
                        path: audit_path(j, &events),
                    },
                })
                .await?;
            }
        }
        Ok(remaining)
    }

    /// Emit whatever can be salvaged from blocks that did not verify:
    /// decoded events if the payload opens, the raw payload otherwise.
    async fn output_best_effort(
        &self,
        blocks: Vec<FetchedBlock>,
        kind: BestEffort,
        out: &mpsc::Sender<CollectorEvent>,
        a: &Assessment,
    ) -> Result<(), CollectorError> {
        let make = |data: Bytes, description: String| {
            let meta = Unverified {
                assessment_id: a.id,
                description,
            };
            match kind {
                BestEffort::Unverified => CollectorEvent::Unverified { data, meta },
                BestEffort::Invalid => CollectorEvent::Invalid { data, meta },
                BestEffort::Duplicate => CollectorEvent::Duplicate { data, meta },
            }
        };

        for block in blocks {
            match decode_block_payload(
                &block.payload,
                &self.config.pub_key,
                &self.config.priv_key,
                &self.config.policy,
                &block.header,
            ) {
                Err(err) => {
                    send(out, make(
                        block.payload.clone(),
                        format!("failed to decode block: {err}"),
                    ))
                    .await?;
                }
                Ok((events, _)) => {
                    for event in events {
                        send(out, make(event, String::new())).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn send(
    out: &mpsc::Sender<CollectorEvent>,
    event: CollectorEvent,
) -> Result<(), CollectorError> {
    out.send(event).await.map_err(|_| CollectorError::OutputClosed)
}
