//! The relay server: one task per connection, one lock over all slots.
//!
//! Handlers take the slot table lock for their entire duration. Requests
//! are bounded in size, so the coarse critical section keeps per-slot
//! updates linearizable without finer locking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use steady_core::{
    auth_tag, wire, BlockHeader, Command, Policy, PolicyId, AUTH_TAG_SIZE,
    BLOCK_HEADER_WIRE_SIZE, MAX_BLOCK_SIZE, POLICY_ID_SIZE, POLICY_WIRE_SIZE, WIRE_VERSION,
};

use crate::error::RelayError;
use crate::slot::{Slot, StoredBlock};

/// Wire length of a write acknowledgement: index plus tag.
const WRITE_REPLY_SIZE: usize = 8 + AUTH_TAG_SIZE;

struct RelayShared {
    token: String,
    slots: tokio::sync::Mutex<HashMap<PolicyId, Slot>>,
}

/// A Steady relay.
///
/// The relay trusts nobody: writes must chain correctly under the
/// policy's keys, and state-changing commands are gated on the shared
/// access token. Read is public by design.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<RelayShared>,
}

impl Relay {
    /// Create a relay with the given access token and no registered
    /// policies.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                token: token.into(),
                slots: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Accept connections forever, one session task per connection.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(session(shared, stream, peer));
        }
    }
}

async fn session(shared: Arc<RelayShared>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let mut prefix = [0u8; 2];
        if stream.read_exact(&mut prefix).await.is_err() {
            debug!(%peer, "session ended");
            return;
        }
        if prefix[0] > WIRE_VERSION {
            warn!(%peer, version = prefix[0], "newer protocol version");
            return;
        }
        let Some(command) = Command::from_u8(prefix[1]) else {
            warn!(%peer, byte = prefix[1], "unknown command");
            return;
        };

        let result = match command {
            Command::Setup => setup(&shared, &mut stream).await,
            Command::Write => write(&shared, &mut stream).await,
            Command::WriteN => write_n(&shared, &mut stream).await,
            Command::Read => read(&shared, &mut stream).await,
            Command::Status => status(&shared, &mut stream).await,
        };
        if let Err(err) = result {
            warn!(%peer, ?command, %err, "command failed, closing session");
            return;
        }
    }
}

async fn read_policy_id(stream: &mut TcpStream) -> Result<PolicyId, RelayError> {
    let mut id = [0u8; POLICY_ID_SIZE];
    stream.read_exact(&mut id).await?;
    Ok(PolicyId::from_bytes(id))
}

/// Register a new policy. Token-authenticated; an already-registered
/// identifier is ignored so retried setups stay harmless.
async fn setup(shared: &RelayShared, stream: &mut TcpStream) -> Result<(), RelayError> {
    let mut buf = [0u8; POLICY_WIRE_SIZE + AUTH_TAG_SIZE];
    stream.read_exact(&mut buf).await?;

    let encoded = &buf[..POLICY_WIRE_SIZE];
    let expected = auth_tag(&shared.token, wire::LABEL_SETUP, &[encoded]);
    if !expected.ct_eq_bytes(&buf[POLICY_WIRE_SIZE..]) {
        return Err(RelayError::AuthFailed);
    }

    let policy = Policy::decode(encoded)?;
    let mut slots = shared.slots.lock().await;
    if slots.contains_key(&policy.id) {
        debug!(id = %policy.id, "policy already registered");
        return Ok(());
    }
    info!(id = %policy.id, space = policy.space, timeout = policy.timeout, "registered policy");
    slots.insert(policy.id, Slot::new(policy));
    Ok(())
}

/// Read one block off the stream and validate it against the slot's
/// policy and the expected index.
async fn read_block(
    stream: &mut TcpStream,
    policy: &Policy,
    expected_index: u64,
) -> Result<StoredBlock, RelayError> {
    let mut header_wire = [0u8; BLOCK_HEADER_WIRE_SIZE];
    stream.read_exact(&mut header_wire).await?;
    let header = BlockHeader::decode(&header_wire, policy)?;

    if header.index != expected_index {
        return Err(RelayError::WrongIndex {
            expected: expected_index,
            got: header.index,
        });
    }
    if header.len_cur > MAX_BLOCK_SIZE {
        return Err(RelayError::BlockTooLarge {
            max: MAX_BLOCK_SIZE,
            got: header.len_cur,
        });
    }
    if header.len_cur > policy.space {
        return Err(RelayError::ExceedsPolicySpace);
    }

    let mut payload = vec![0u8; header.payload_len() as usize];
    stream.read_exact(&mut payload).await?;
    if !steady_core::check_payload_hash(&payload, policy, &header) {
        return Err(RelayError::PayloadHashMismatch);
    }

    Ok(StoredBlock {
        header,
        header_wire,
        payload: Bytes::from(payload),
    })
}

fn write_reply(token: &str, id: &PolicyId, index: u64, label: &[u8]) -> [u8; WRITE_REPLY_SIZE] {
    let mut reply = [0u8; WRITE_REPLY_SIZE];
    reply[..8].copy_from_slice(&index.to_be_bytes());
    let tag = auth_tag(token, label, &[id.as_bytes(), &reply[..8]]);
    reply[8..].copy_from_slice(tag.as_bytes());
    reply
}

/// Append one block. The reply carries the stored index authenticated
/// under the token, which is what lets the device treat writes as
/// at-least-once: a retried index is rejected here and never stored
/// twice.
async fn write(shared: &RelayShared, stream: &mut TcpStream) -> Result<(), RelayError> {
    let id = read_policy_id(stream).await?;

    let mut slots = shared.slots.lock().await;
    let slot = slots
        .get_mut(&id)
        .ok_or_else(|| RelayError::UnknownPolicy(id.to_hex()))?;

    let block = read_block(stream, &slot.policy, slot.next_index).await?;
    let index = block.header.index;
    slot.store(block);
    debug!(%id, index, "stored block");

    let reply = write_reply(&shared.token, &id, index, wire::LABEL_WRITE);
    stream.write_all(&reply).await?;
    Ok(())
}

/// Append a batch of blocks, all-or-nothing. Any invalid block gets a
/// 40-byte zero reply and ends the session; nothing is committed.
async fn write_n(shared: &RelayShared, stream: &mut TcpStream) -> Result<(), RelayError> {
    let id = read_policy_id(stream).await?;

    let mut slots = shared.slots.lock().await;
    let slot = slots
        .get_mut(&id)
        .ok_or_else(|| RelayError::UnknownPolicy(id.to_hex()))?;

    let mut count_buf = [0u8; 2];
    stream.read_exact(&mut count_buf).await?;
    let count = u16::from_be_bytes(count_buf);

    let mut staged = Vec::with_capacity(count as usize);
    for i in 0..count as u64 {
        match read_block(stream, &slot.policy, slot.next_index + i).await {
            Ok(block) => staged.push(block),
            Err(err) => {
                stream.write_all(&[0u8; WRITE_REPLY_SIZE]).await?;
                return Err(err);
            }
        }
    }
    let Some(last) = staged.last().map(|b| b.header.index) else {
        // An empty batch commits nothing and is answered like a failed
        // one, but it is not worth ending the session over.
        stream.write_all(&[0u8; WRITE_REPLY_SIZE]).await?;
        return Ok(());
    };
    for block in staged {
        slot.store(block);
    }
    debug!(%id, count, last, "stored block batch");

    let reply = write_reply(&shared.token, &id, last, wire::LABEL_WRITE_N);
    stream.write_all(&reply).await?;
    Ok(())
}

/// Return all blocks with index at or above the requested start, most
/// recent first. Public: possession of the policy identifier is enough.
async fn read(shared: &RelayShared, stream: &mut TcpStream) -> Result<(), RelayError> {
    let id = read_policy_id(stream).await?;
    let mut start_buf = [0u8; 8];
    stream.read_exact(&mut start_buf).await?;
    let start = u64::from_be_bytes(start_buf);

    let slots = shared.slots.lock().await;
    let Some(slot) = slots.get(&id) else {
        debug!(%id, "read for unknown policy");
        stream.write_all(&0u64.to_be_bytes()).await?;
        return Ok(());
    };

    let count = slot.count_from(start);
    stream.write_all(&count.to_be_bytes()).await?;
    for block in slot
        .blocks
        .iter()
        .rev()
        .take_while(|b| b.header.index >= start)
    {
        stream.write_all(&block.header_wire).await?;
        stream.write_all(&block.payload).await?;
    }
    debug!(%id, start, count, "served read");
    Ok(())
}

/// Report the latest block header for a policy. Token-authenticated so
/// the relay does not leak which identifiers exist.
async fn status(shared: &RelayShared, stream: &mut TcpStream) -> Result<(), RelayError> {
    let id = read_policy_id(stream).await?;
    let mut tag = [0u8; AUTH_TAG_SIZE];
    stream.read_exact(&mut tag).await?;

    let expected = auth_tag(&shared.token, wire::LABEL_STATUS, &[id.as_bytes()]);
    if !expected.ct_eq_bytes(&tag) {
        stream.write_all(&[wire::FLAG_AUTH_ERR]).await?;
        return Err(RelayError::AuthFailed);
    }

    let slots = shared.slots.lock().await;
    match slots.get(&id) {
        None => stream.write_all(&[wire::FLAG_FALSE]).await?,
        Some(slot) => match slot.blocks.back() {
            None => stream.write_all(&[wire::FLAG_TRUE]).await?,
            Some(latest) => {
                stream.write_all(&[wire::FLAG_MORE]).await?;
                stream.write_all(&latest.header_wire).await?;
            }
        },
    }
    Ok(())
}
