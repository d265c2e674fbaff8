//! Wire-level tests for the relay: a raw client drives real sessions
//! over TCP and checks what the relay stores, rejects, and evicts.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use steady_core::{
    auth_tag, encode_block, encrypt_keygen, wire, BlockHeader, Command, Keypair, Policy,
    PolicyId, PolicyParams, AUTH_TAG_SIZE, BLOCK_HEADER_WIRE_SIZE, WIRE_VERSION,
};
use steady_relay::Relay;

const TOKEN: &str = "test-token";

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Relay::new(TOKEN);
    tokio::spawn(async move {
        let _ = relay.serve(listener).await;
    });
    addr
}

fn fixture(space: u64) -> (Keypair, Policy) {
    let keypair = Keypair::generate();
    let (pub_key, _) = encrypt_keygen();
    let policy = Policy::create(
        &keypair,
        pub_key,
        PolicyParams {
            timeout: 1,
            space,
            time: 0,
        },
    );
    (keypair, policy)
}

/// Build `count` chained blocks, one event of `event_len` bytes each.
fn make_blocks(policy: &Policy, keypair: &Keypair, count: u64, event_len: usize) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut len_prev = 0u64;
    for index in 0..count {
        let events = vec![vec![index as u8; event_len]];
        let block =
            encode_block(index, len_prev, index, false, false, policy, &events, keypair).unwrap();
        len_prev = block.len() as u64;
        blocks.push(block);
    }
    blocks
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn send_setup(conn: &mut TcpStream, policy: &Policy, token: &str) {
    let encoded = policy.encode();
    let tag = auth_tag(token, wire::LABEL_SETUP, &[&encoded]);
    conn.write_all(&[WIRE_VERSION, Command::Setup.as_u8()])
        .await
        .unwrap();
    conn.write_all(&encoded).await.unwrap();
    conn.write_all(tag.as_bytes()).await.unwrap();
}

async fn setup(addr: SocketAddr, policy: &Policy) {
    let mut conn = connect(addr).await;
    send_setup(&mut conn, policy, TOKEN).await;
    // Setup has no reply; a status round-trip confirms it landed.
    let (flag, _) = send_status(&mut conn, &policy.id).await;
    assert_eq!(flag, wire::FLAG_TRUE);
}

async fn send_status(conn: &mut TcpStream, id: &PolicyId) -> (u8, Option<[u8; 192]>) {
    conn.write_all(&[WIRE_VERSION, Command::Status.as_u8()])
        .await
        .unwrap();
    conn.write_all(id.as_bytes()).await.unwrap();
    conn.write_all(auth_tag(TOKEN, wire::LABEL_STATUS, &[id.as_bytes()]).as_bytes())
        .await
        .unwrap();
    let mut flag = [0u8; 1];
    conn.read_exact(&mut flag).await.unwrap();
    if flag[0] == wire::FLAG_MORE {
        let mut header = [0u8; BLOCK_HEADER_WIRE_SIZE];
        conn.read_exact(&mut header).await.unwrap();
        (flag[0], Some(header))
    } else {
        (flag[0], None)
    }
}

/// Send one block; return the raw 40-byte reply if the relay sends one.
/// A rejected write closes the session, which can surface as a failed
/// write on this side as easily as a failed read.
async fn send_write(conn: &mut TcpStream, id: &PolicyId, block: &[u8]) -> Option<[u8; 40]> {
    let frame = async {
        conn.write_all(&[WIRE_VERSION, Command::Write.as_u8()]).await?;
        conn.write_all(id.as_bytes()).await?;
        conn.write_all(block).await?;
        let mut reply = [0u8; 40];
        conn.read_exact(&mut reply).await?;
        std::io::Result::Ok(reply)
    };
    frame.await.ok()
}

async fn send_read(conn: &mut TcpStream, id: &PolicyId, start: u64, policy: &Policy) -> Vec<(BlockHeader, Vec<u8>)> {
    conn.write_all(&[WIRE_VERSION, Command::Read.as_u8()])
        .await
        .unwrap();
    conn.write_all(id.as_bytes()).await.unwrap();
    conn.write_all(&start.to_be_bytes()).await.unwrap();

    let mut count_buf = [0u8; 8];
    conn.read_exact(&mut count_buf).await.unwrap();
    let count = u64::from_be_bytes(count_buf);

    let mut blocks = Vec::new();
    for _ in 0..count {
        let mut header_wire = [0u8; BLOCK_HEADER_WIRE_SIZE];
        conn.read_exact(&mut header_wire).await.unwrap();
        let header = BlockHeader::decode(&header_wire, policy).unwrap();
        let mut payload = vec![0u8; header.payload_len() as usize];
        conn.read_exact(&mut payload).await.unwrap();
        blocks.push((header, payload));
    }
    blocks
}

#[tokio::test]
async fn accepted_writes_read_back_exactly() {
    let addr = start_relay().await;
    let (keypair, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let blocks = make_blocks(&policy, &keypair, 3, 16);
    let mut conn = connect(addr).await;
    for block in &blocks {
        let reply = send_write(&mut conn, &policy.id, block).await.unwrap();
        let index = u64::from_be_bytes(reply[..8].try_into().unwrap());
        assert_eq!(index.to_be_bytes(), block[..8]);
        let tag = auth_tag(TOKEN, wire::LABEL_WRITE, &[policy.id.as_bytes(), &reply[..8]]);
        assert!(tag.ct_eq_bytes(&reply[8..]));
    }

    // The relay replies most recent first; re-sort by index.
    let mut returned = send_read(&mut conn, &policy.id, 0, &policy).await;
    assert_eq!(returned.len(), 3);
    assert!(returned.windows(2).all(|w| w[0].0.index > w[1].0.index));
    returned.sort_by_key(|(header, _)| header.index);
    for (i, (header, payload)) in returned.iter().enumerate() {
        assert_eq!(header.index, i as u64);
        let mut encoded = header.encode().to_vec();
        encoded.extend_from_slice(payload);
        assert_eq!(&encoded, &blocks[i]);
    }

    // A higher start index narrows the result.
    let tail = send_read(&mut conn, &policy.id, 2, &policy).await;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].0.index, 2);
}

#[tokio::test]
async fn wrong_index_write_changes_nothing() {
    let addr = start_relay().await;
    let (keypair, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let blocks = make_blocks(&policy, &keypair, 2, 16);

    // Index 1 before index 0: the session dies without a reply.
    let mut conn = connect(addr).await;
    assert!(send_write(&mut conn, &policy.id, &blocks[1]).await.is_none());

    let mut conn = connect(addr).await;
    assert!(send_read(&mut conn, &policy.id, 0, &policy).await.is_empty());

    // A replayed index is rejected the same way, with the store intact.
    send_write(&mut conn, &policy.id, &blocks[0]).await.unwrap();
    let mut conn2 = connect(addr).await;
    assert!(send_write(&mut conn2, &policy.id, &blocks[0]).await.is_none());

    let mut conn = connect(addr).await;
    let returned = send_read(&mut conn, &policy.id, 0, &policy).await;
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].0.index, 0);
}

#[tokio::test]
async fn eviction_retains_only_a_fitting_suffix() {
    let addr = start_relay().await;
    let (keypair, policy) = fixture(700);
    setup(addr, &policy).await;

    // Each block is 192 + 2 + 100 + 32 = 326 bytes; three exceed 700.
    let blocks = make_blocks(&policy, &keypair, 3, 100);
    let mut conn = connect(addr).await;
    for block in &blocks {
        send_write(&mut conn, &policy.id, block).await.unwrap();
    }

    let returned = send_read(&mut conn, &policy.id, 0, &policy).await;
    let indices: Vec<u64> = returned.iter().map(|(h, _)| h.index).collect();
    assert_eq!(indices, vec![2, 1]);
    let total: u64 = returned.iter().map(|(h, _)| h.len_cur).sum();
    assert!(total <= policy.space);

    // The evicted head stays gone, and status reports the newest block.
    let (flag, header) = send_status(&mut conn, &policy.id).await;
    assert_eq!(flag, wire::FLAG_MORE);
    let header = BlockHeader::decode(&header.unwrap(), &policy).unwrap();
    assert_eq!(header.index, 2);
}

#[tokio::test]
async fn corrupted_payload_is_rejected_and_not_stored() {
    let addr = start_relay().await;
    let (keypair, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let mut block = make_blocks(&policy, &keypair, 1, 16).remove(0);
    let last = block.len() - 1;
    block[last] ^= 0x01;

    let mut conn = connect(addr).await;
    assert!(send_write(&mut conn, &policy.id, &block).await.is_none());

    let mut conn = connect(addr).await;
    let (flag, _) = send_status(&mut conn, &policy.id).await;
    assert_eq!(flag, wire::FLAG_TRUE);
}

#[tokio::test]
async fn write_batch_is_all_or_nothing() {
    let addr = start_relay().await;
    let (keypair, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let blocks = make_blocks(&policy, &keypair, 3, 16);

    // A batch with a corrupted middle block commits nothing.
    let mut conn = connect(addr).await;
    conn.write_all(&[WIRE_VERSION, Command::WriteN.as_u8()])
        .await
        .unwrap();
    conn.write_all(policy.id.as_bytes()).await.unwrap();
    conn.write_all(&3u16.to_be_bytes()).await.unwrap();
    conn.write_all(&blocks[0]).await.unwrap();
    let mut bad = blocks[1].clone();
    let last = bad.len() - 1;
    bad[last] ^= 0x01;
    conn.write_all(&bad).await.unwrap();
    let mut reply = [0u8; 40];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0u8; 40]);

    let mut conn = connect(addr).await;
    assert!(send_read(&mut conn, &policy.id, 0, &policy).await.is_empty());

    // The intact batch lands atomically, acknowledged by the last index.
    conn.write_all(&[WIRE_VERSION, Command::WriteN.as_u8()])
        .await
        .unwrap();
    conn.write_all(policy.id.as_bytes()).await.unwrap();
    conn.write_all(&3u16.to_be_bytes()).await.unwrap();
    for block in &blocks {
        conn.write_all(block).await.unwrap();
    }
    let mut reply = [0u8; 40];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(u64::from_be_bytes(reply[..8].try_into().unwrap()), 2);
    let tag = auth_tag(TOKEN, wire::LABEL_WRITE_N, &[policy.id.as_bytes(), &reply[..8]]);
    assert!(tag.ct_eq_bytes(&reply[8..]));

    let returned = send_read(&mut conn, &policy.id, 0, &policy).await;
    assert_eq!(returned.len(), 3);
}

#[tokio::test]
async fn setup_requires_the_token() {
    let addr = start_relay().await;
    let (_, policy) = fixture(1 << 20);

    let mut conn = connect(addr).await;
    let encoded = policy.encode();
    let tag = auth_tag("wrong-token", wire::LABEL_SETUP, &[&encoded]);
    conn.write_all(&[WIRE_VERSION, Command::Setup.as_u8()])
        .await
        .unwrap();
    conn.write_all(&encoded).await.unwrap();
    conn.write_all(tag.as_bytes()).await.unwrap();

    // The policy never registered.
    let mut conn = connect(addr).await;
    let (flag, _) = send_status(&mut conn, &policy.id).await;
    assert_eq!(flag, wire::FLAG_FALSE);
}

#[tokio::test]
async fn status_rejects_a_bad_tag() {
    let addr = start_relay().await;
    let (_, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let mut conn = connect(addr).await;
    conn.write_all(&[WIRE_VERSION, Command::Status.as_u8()])
        .await
        .unwrap();
    conn.write_all(policy.id.as_bytes()).await.unwrap();
    conn.write_all(&[0u8; AUTH_TAG_SIZE]).await.unwrap();
    let mut flag = [0u8; 1];
    conn.read_exact(&mut flag).await.unwrap();
    assert_eq!(flag[0], wire::FLAG_AUTH_ERR);
}

#[tokio::test]
async fn read_of_unknown_policy_returns_nothing() {
    let addr = start_relay().await;
    let (_, policy) = fixture(1 << 20);

    let mut conn = connect(addr).await;
    assert!(send_read(&mut conn, &policy.id, 0, &policy).await.is_empty());
}

#[tokio::test]
async fn newer_protocol_version_ends_the_session() {
    let addr = start_relay().await;
    let (_, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let mut conn = connect(addr).await;
    conn.write_all(&[WIRE_VERSION + 1, Command::Status.as_u8()])
        .await
        .unwrap();
    conn.write_all(policy.id.as_bytes()).await.unwrap();
    conn.write_all(auth_tag(TOKEN, wire::LABEL_STATUS, &[policy.id.as_bytes()]).as_bytes())
        .await
        .unwrap();
    let mut flag = [0u8; 1];
    assert!(conn.read_exact(&mut flag).await.is_err());
}

#[tokio::test]
async fn setup_is_idempotent_per_identifier() {
    let addr = start_relay().await;
    let (keypair, policy) = fixture(1 << 20);
    setup(addr, &policy).await;

    let blocks = make_blocks(&policy, &keypair, 1, 16);
    let mut conn = connect(addr).await;
    send_write(&mut conn, &policy.id, &blocks[0]).await.unwrap();

    // A second setup for the same identifier is ignored: the stored
    // block survives.
    let mut conn = connect(addr).await;
    send_setup(&mut conn, &policy, TOKEN).await;
    let (flag, _) = send_status(&mut conn, &policy.id).await;
    assert_eq!(flag, wire::FLAG_MORE);
}
