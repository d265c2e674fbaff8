//! The device logger: provisioning, status reconciliation, and the
//! bounded logging pipeline.
//!
//! ```text
//! log() --msgs--> packer --blocks--> sender --tcp--> relay
//! ```
//!
//! The packer buffers messages and cuts a block when the buffer reaches
//! the flush size, when the policy timeout fires, or at close. The
//! timeout path emits a block even from an empty buffer; that heartbeat
//! is what lets a collector tell silence from suppression. The sender
//! re-sends each block until the relay acknowledges its exact index, so
//! delivery is at-least-once and the relay's index check makes retries
//! harmless.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use steady_core::{
    auth_tag, encode_block, wire, BlockHeader, Command, Keypair, Policy, PolicyId, PolicyParams,
    X25519PublicKey, AUTH_TAG_SIZE, BLOCK_HEADER_WIRE_SIZE, MAX_EVENT_SIZE, WIRE_VERSION,
};

use crate::config::{device_path, state_path, DeviceConfig, DeviceState};
use crate::error::DeviceError;

/// Tuning for a loaded device.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Encrypt block payloads to the policy's encryption key.
    pub encrypt: bool,
    /// Compress block payloads.
    pub compress: bool,
    /// Cut a block once buffered messages reach this many bytes.
    pub flush_size: usize,
    /// Capacity of the encoded-block queue between packer and sender.
    pub buffer_depth: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            compress: true,
            flush_size: 64 * 1024,
            buffer_depth: 8,
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What the relay reported for a policy identifier.
enum StatusReply {
    Unknown,
    Empty,
    Latest([u8; BLOCK_HEADER_WIRE_SIZE]),
}

async fn check_status(
    conn: &mut TcpStream,
    id: &PolicyId,
    token: &str,
) -> Result<StatusReply, DeviceError> {
    conn.write_all(&[WIRE_VERSION, Command::Status.as_u8()]).await?;
    conn.write_all(id.as_bytes()).await?;
    conn.write_all(auth_tag(token, wire::LABEL_STATUS, &[id.as_bytes()]).as_bytes())
        .await?;

    let mut flag = [0u8; 1];
    conn.read_exact(&mut flag).await?;
    match flag[0] {
        wire::FLAG_FALSE => Ok(StatusReply::Unknown),
        wire::FLAG_TRUE => Ok(StatusReply::Empty),
        wire::FLAG_MORE => {
            let mut header = [0u8; BLOCK_HEADER_WIRE_SIZE];
            conn.read_exact(&mut header).await?;
            Ok(StatusReply::Latest(header))
        }
        wire::FLAG_AUTH_ERR => Err(DeviceError::AuthRejected),
        other => Err(DeviceError::UnexpectedReply(other)),
    }
}

/// Create a fresh policy, register it at the relay, and persist the
/// device secret file at `<stem>.device`.
///
/// Refuses to run if the device or state file already exists.
pub async fn provision(
    keypair: &Keypair,
    encrypt_key: &X25519PublicKey,
    params: PolicyParams,
    stem: &str,
    server: &str,
    token: &str,
) -> Result<Policy, DeviceError> {
    for path in [device_path(stem), state_path(stem)] {
        if path.exists() {
            return Err(DeviceError::ConfigExists(path));
        }
    }

    let policy = Policy::create(keypair, *encrypt_key, params);
    let mut conn = TcpStream::connect(server).await?;

    let encoded = policy.encode();
    conn.write_all(&[WIRE_VERSION, Command::Setup.as_u8()]).await?;
    conn.write_all(&encoded).await?;
    conn.write_all(auth_tag(token, wire::LABEL_SETUP, &[&encoded]).as_bytes())
        .await?;

    match check_status(&mut conn, &policy.id, token).await? {
        StatusReply::Empty => {}
        _ => return Err(DeviceError::SetupRejected),
    }

    DeviceConfig {
        keypair: keypair.clone(),
        policy: policy.clone(),
    }
    .write(&device_path(stem))?;
    info!(id = %policy.id, "provisioned device");
    Ok(policy)
}

/// A loaded, running device logger.
pub struct Device {
    policy: Policy,
    log_tx: mpsc::Sender<Vec<u8>>,
    packer: JoinHandle<Result<(), DeviceError>>,
}

impl Device {
    /// Load a device from `<stem>.device` / `<stem>.state`, reconcile
    /// with the relay's status reply, and start the logging pipeline.
    ///
    /// Reconciliation refuses a relay that claims less history than the
    /// local state remembers shipping; that is how a relay rollback (or
    /// a relay swap) surfaces instead of silently restarting the chain.
    pub async fn load(
        stem: &str,
        server: &str,
        token: &str,
        options: DeviceOptions,
    ) -> Result<Self, DeviceError> {
        let config = DeviceConfig::read(&device_path(stem))?;
        let state_file = state_path(stem);
        // A missing or unreadable state file means a device that never
        // shut down cleanly; the relay's answer takes over from here.
        let mut state = DeviceState::read(&state_file)
            .unwrap_or_else(|_| DeviceState::initial(&config.policy));

        let mut conn = TcpStream::connect(server).await?;
        match check_status(&mut conn, &config.policy.id, token).await? {
            StatusReply::Unknown => return Err(DeviceError::NotRegistered),
            StatusReply::Empty => {
                if state.next_index != 0 {
                    return Err(DeviceError::RelayEmptyRollback {
                        next_index: state.next_index,
                    });
                }
            }
            StatusReply::Latest(header) => {
                let header = BlockHeader::decode(&header, &config.policy)?;
                if header.index + 1 < state.next_index {
                    return Err(DeviceError::RelayBehind {
                        relay: header.index,
                        local: state.next_index,
                    });
                }
                state.next_index = header.index + 1;
                state.len_prev = header.len_cur;
                state.time_prev = header.time;
            }
        }
        debug!(id = %config.policy.id, next_index = state.next_index, "device loaded");

        // Sizing note: messages average a few hundred bytes, so the
        // message queue holds roughly one flush worth of them.
        let (log_tx, log_rx) = mpsc::channel((options.flush_size / 512).max(1));
        let policy = config.policy.clone();
        let packer = Packer {
            keypair: config.keypair,
            policy: config.policy,
            options,
            state,
            state_file,
            server: server.to_string(),
            token: token.to_string(),
            buffer: Vec::new(),
            buffer_bytes: 0,
        };
        let packer = tokio::spawn(packer.run(log_rx, conn));

        Ok(Self {
            policy,
            log_tx,
            packer,
        })
    }

    /// The policy this device logs under.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Enqueue one event. Blocks when the message queue is full; that
    /// backpressure is the intended rate limit.
    pub async fn log(&self, message: impl Into<Vec<u8>>) -> Result<(), DeviceError> {
        let message = message.into();
        if message.len() > MAX_EVENT_SIZE {
            return Err(DeviceError::EventTooLarge {
                max: MAX_EVENT_SIZE,
                got: message.len(),
            });
        }
        self.log_tx
            .send(message)
            .await
            .map_err(|_| DeviceError::Closed)
    }

    /// Drain and stop: flush buffered events as a final block, wait for
    /// the sender to get every block acknowledged, persist the resume
    /// state, and release all resources.
    ///
    /// There is no deadline; a partitioned relay keeps close waiting.
    pub async fn close(self) -> Result<(), DeviceError> {
        drop(self.log_tx);
        self.packer
            .await
            .map_err(|err| DeviceError::Task(err.to_string()))?
    }
}

/// An encoded block on its way to the sender.
struct OutboundBlock {
    index: u64,
    bytes: Vec<u8>,
}

struct Packer {
    keypair: Keypair,
    policy: Policy,
    options: DeviceOptions,
    state: DeviceState,
    state_file: PathBuf,
    server: String,
    token: String,
    buffer: Vec<Vec<u8>>,
    buffer_bytes: usize,
}

impl Packer {
    async fn run(
        mut self,
        mut log_rx: mpsc::Receiver<Vec<u8>>,
        conn: TcpStream,
    ) -> Result<(), DeviceError> {
        let (block_tx, block_rx) = mpsc::channel(self.options.buffer_depth.max(1));
        let sender = tokio::spawn(run_sender(
            self.server.clone(),
            conn,
            block_rx,
            self.policy.id,
            self.token.clone(),
        ));

        // The first deadline credits time already spent since the last
        // block, so a reloaded device does not stretch the cadence.
        let elapsed = now_unix().saturating_sub(self.state.time_prev);
        let first = self.policy.timeout.saturating_sub(elapsed);
        let timer = sleep_until(Instant::now() + Duration::from_secs(first));
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = timer.as_mut() => {
                    self.flush(&block_tx).await?;
                    timer.as_mut().reset(Instant::now() + Duration::from_secs(self.policy.timeout));
                }
                message = log_rx.recv() => match message {
                    Some(message) => {
                        self.buffer_bytes += message.len() + 2;
                        self.buffer.push(message);
                        if self.buffer_bytes >= self.options.flush_size {
                            self.flush(&block_tx).await?;
                            timer.as_mut().reset(
                                Instant::now() + Duration::from_secs(self.policy.timeout),
                            );
                        }
                    }
                    None => {
                        // Closing: the queue is drained. Flush leftovers,
                        // let the sender finish, then persist state.
                        if !self.buffer.is_empty() {
                            self.flush(&block_tx).await?;
                        }
                        drop(block_tx);
                        sender
                            .await
                            .map_err(|err| DeviceError::Task(err.to_string()))??;
                        self.state.write(&self.state_file)?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Encode the buffered events as the next block and hand it to the
    /// sender. An encode failure here means the device itself produced
    /// bad input and is permanent.
    async fn flush(&mut self, block_tx: &mpsc::Sender<OutboundBlock>) -> Result<(), DeviceError> {
        let time = now_unix();
        let index = self.state.next_index;
        let block = encode_block(
            index,
            self.state.len_prev,
            time,
            self.options.encrypt,
            self.options.compress,
            &self.policy,
            &self.buffer,
            &self.keypair,
        )?;
        debug!(index, events = self.buffer.len(), bytes = block.len(), "packed block");

        self.state.next_index += 1;
        self.state.len_prev = block.len() as u64;
        self.state.time_prev = time;
        self.buffer.clear();
        self.buffer_bytes = 0;

        block_tx
            .send(OutboundBlock {
                index,
                bytes: block,
            })
            .await
            .map_err(|_| DeviceError::Closed)
    }
}

async fn run_sender(
    server: String,
    mut conn: TcpStream,
    mut block_rx: mpsc::Receiver<OutboundBlock>,
    id: PolicyId,
    token: String,
) -> Result<(), DeviceError> {
    while let Some(block) = block_rx.recv().await {
        send_until_acked(&server, &mut conn, &block, &id, &token).await;
    }
    Ok(())
}

/// Hammer one block at the relay until the acknowledgement matches.
///
/// Transport failures reconnect and retry forever; the relay rejecting a
/// replayed index still answers with the authenticated index, which is
/// indistinguishable from success here and exactly what at-least-once
/// needs.
async fn send_until_acked(
    server: &str,
    conn: &mut TcpStream,
    block: &OutboundBlock,
    id: &PolicyId,
    token: &str,
) {
    loop {
        match try_write(conn, block, id, token).await {
            Ok(true) => return,
            Ok(false) => {
                debug!(index = block.index, "write not acknowledged, retrying");
            }
            Err(err) => {
                warn!(index = block.index, %err, "transport failure, reconnecting");
                *conn = reconnect(server).await;
            }
        }
    }
}

async fn reconnect(server: &str) -> TcpStream {
    loop {
        match TcpStream::connect(server).await {
            Ok(conn) => return conn,
            Err(err) => {
                warn!(%err, "reconnect failed, backing off");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn try_write(
    conn: &mut TcpStream,
    block: &OutboundBlock,
    id: &PolicyId,
    token: &str,
) -> std::io::Result<bool> {
    conn.write_all(&[WIRE_VERSION, Command::Write.as_u8()]).await?;
    conn.write_all(id.as_bytes()).await?;
    conn.write_all(&block.bytes).await?;

    let mut reply = [0u8; 8 + AUTH_TAG_SIZE];
    conn.read_exact(&mut reply).await?;
    let index_bytes = block.index.to_be_bytes();
    let expected = auth_tag(token, wire::LABEL_WRITE, &[id.as_bytes(), &index_bytes]);
    Ok(reply[..8] == index_bytes && expected.ct_eq_bytes(&reply[8..]))
}
