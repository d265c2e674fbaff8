//! Block codec: the atomic append unit of the log.
//!
//! A block is a fixed 192-byte header followed by an opaque payload. The
//! payload packs length-prefixed events and a random 32-byte IV, then is
//! optionally compressed and optionally encrypted, in that order. The two
//! flags are never stored as plain bytes: they only enter the keyed
//! header hash, and decoders recover them by probing the four
//! combinations. Any observer can therefore verify header integrity
//! without trusting flag bytes on the wire.

use bytes::Bytes;
use hex::FromHex;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::crypto::{
    compress, decompress, decrypt, encrypt, khash, Blake2Hash, Ed25519Signature, Keypair,
    X25519PublicKey, X25519SecretKey, HASH_SIZE, SIGNATURE_SIZE,
};
use crate::error::CoreError;
use crate::policy::Policy;
use crate::wire::{FLAG_FALSE, FLAG_TRUE};

/// Random IV length per block, in bytes.
pub const IV_SIZE: usize = 32;

/// Encoded block header length on the wire:
/// index, len_cur, len_prev, payload hash, header hash, root hash, time,
/// signature.
pub const BLOCK_HEADER_WIRE_SIZE: usize = 4 * 8 + 3 * HASH_SIZE + SIGNATURE_SIZE;

/// Maximum encoded block length the relay accepts (100 MiB).
pub const MAX_BLOCK_SIZE: u64 = 104_857_600;

/// Maximum length of a single event (fits the u16 length prefix).
pub const MAX_EVENT_SIZE: usize = 65_535;

/// The 32-byte random IV that re-keys a block's Merkle root.
///
/// Two blocks carrying the same event list still end up with different
/// root hashes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Iv(pub [u8; IV_SIZE]);

impl Iv {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv({})", &hex::encode(self.0)[..16])
    }
}

impl Serialize for Iv {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Iv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = <[u8; IV_SIZE]>::from_hex(&s).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// A decoded block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Position in the append log, starting at zero.
    pub index: u64,
    /// Total encoded length of this block, header included.
    pub len_cur: u64,
    /// `len_cur` of the previous block, zero at index zero.
    pub len_prev: u64,
    /// Device clock at encoding, seconds since the Unix epoch.
    pub time: u64,
    /// Keyed digest of the payload as it appears on the wire.
    pub payload_hash: Blake2Hash,
    /// Keyed digest binding index, lengths, payload hash, and flags.
    pub header_hash: Blake2Hash,
    /// Keyed digest of the event Merkle root under the block IV.
    pub root_hash: Blake2Hash,
    /// Signature over header hash, root hash, and time.
    pub signature: Ed25519Signature,
    /// Whether the payload is encrypted. Recovered, not stored.
    pub encrypted: bool,
    /// Whether the payload is compressed. Recovered, not stored.
    pub compressed: bool,
}

fn flag_byte(flag: bool) -> u8 {
    if flag {
        FLAG_TRUE
    } else {
        FLAG_FALSE
    }
}

/// The keyed-hash input that commits the header fields and the two flags.
fn header_hash_input(
    index: u64,
    len_cur: u64,
    len_prev: u64,
    payload_hash: &Blake2Hash,
    encrypted: bool,
    compressed: bool,
) -> [u8; 3 * 8 + HASH_SIZE + 2] {
    let mut input = [0u8; 3 * 8 + HASH_SIZE + 2];
    input[..8].copy_from_slice(&index.to_be_bytes());
    input[8..16].copy_from_slice(&len_cur.to_be_bytes());
    input[16..24].copy_from_slice(&len_prev.to_be_bytes());
    input[24..24 + HASH_SIZE].copy_from_slice(payload_hash.as_bytes());
    input[24 + HASH_SIZE] = flag_byte(encrypted);
    input[24 + HASH_SIZE + 1] = flag_byte(compressed);
    input
}

/// The message covered by the block signature.
fn signed_message(header_hash: &Blake2Hash, root_hash: &Blake2Hash, time: u64) -> [u8; 72] {
    let mut message = [0u8; 2 * HASH_SIZE + 8];
    message[..HASH_SIZE].copy_from_slice(header_hash.as_bytes());
    message[HASH_SIZE..2 * HASH_SIZE].copy_from_slice(root_hash.as_bytes());
    message[2 * HASH_SIZE..].copy_from_slice(&time.to_be_bytes());
    message
}

impl BlockHeader {
    /// Payload length implied by `len_cur`.
    pub fn payload_len(&self) -> u64 {
        self.len_cur - BLOCK_HEADER_WIRE_SIZE as u64
    }

    /// Re-emit the fixed wire form of this header.
    pub fn encode(&self) -> [u8; BLOCK_HEADER_WIRE_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_WIRE_SIZE];
        buf[..8].copy_from_slice(&self.index.to_be_bytes());
        buf[8..16].copy_from_slice(&self.len_cur.to_be_bytes());
        buf[16..24].copy_from_slice(&self.len_prev.to_be_bytes());
        buf[24..24 + HASH_SIZE].copy_from_slice(self.payload_hash.as_bytes());
        buf[24 + HASH_SIZE..24 + 2 * HASH_SIZE].copy_from_slice(self.header_hash.as_bytes());
        buf[24 + 2 * HASH_SIZE..24 + 3 * HASH_SIZE].copy_from_slice(self.root_hash.as_bytes());
        buf[24 + 3 * HASH_SIZE..32 + 3 * HASH_SIZE].copy_from_slice(&self.time.to_be_bytes());
        buf[32 + 3 * HASH_SIZE..].copy_from_slice(self.signature.as_bytes());
        buf
    }

    /// Decode and verify a block header against its policy.
    ///
    /// Verifies the signature over the signed fields, then recovers the
    /// encryption and compression flags by probing the four combinations
    /// against the keyed header hash (in constant time per probe).
    pub fn decode(encoded: &[u8], policy: &Policy) -> Result<Self, CoreError> {
        if encoded.len() < BLOCK_HEADER_WIRE_SIZE {
            return Err(CoreError::HeaderTooShort {
                expected: BLOCK_HEADER_WIRE_SIZE,
                got: encoded.len(),
            });
        }

        let u64_at = |o: usize| {
            let mut tmp = [0u8; 8];
            tmp.copy_from_slice(&encoded[o..o + 8]);
            u64::from_be_bytes(tmp)
        };
        let hash_at = |o: usize| {
            let mut tmp = [0u8; HASH_SIZE];
            tmp.copy_from_slice(&encoded[o..o + HASH_SIZE]);
            Blake2Hash::from_bytes(tmp)
        };

        let index = u64_at(0);
        let len_cur = u64_at(8);
        let len_prev = u64_at(16);
        let payload_hash = hash_at(24);
        let header_hash = hash_at(24 + HASH_SIZE);
        let root_hash = hash_at(24 + 2 * HASH_SIZE);
        let time = u64_at(24 + 3 * HASH_SIZE);
        let mut sig_bytes = [0u8; SIGNATURE_SIZE];
        sig_bytes.copy_from_slice(&encoded[32 + 3 * HASH_SIZE..BLOCK_HEADER_WIRE_SIZE]);
        let signature = Ed25519Signature::from_bytes(sig_bytes);

        policy
            .vk
            .verify(&signed_message(&header_hash, &root_hash, time), &signature)?;

        // Recover the flags: only the committed combination reproduces
        // the keyed header hash.
        let probe = |encrypted: bool, compressed: bool| {
            let input =
                header_hash_input(index, len_cur, len_prev, &payload_hash, encrypted, compressed);
            policy.keyed_digest(&[&input]).ct_eq(&header_hash)
        };
        let (encrypted, compressed) = if probe(true, true) {
            (true, true)
        } else if probe(true, false) {
            (true, false)
        } else if probe(false, true) {
            (false, true)
        } else if probe(false, false) {
            (false, false)
        } else {
            return Err(CoreError::HeaderHashMismatch);
        };

        if len_cur < BLOCK_HEADER_WIRE_SIZE as u64 {
            return Err(CoreError::HeaderLengthUnderflow);
        }

        Ok(BlockHeader {
            index,
            len_cur,
            len_prev,
            time,
            payload_hash,
            header_hash,
            root_hash,
            signature,
            encrypted,
            compressed,
        })
    }
}

/// Pack events into the wire payload.
///
/// Returns the payload as it goes on the wire together with its keyed
/// digest and the IV-keyed Merkle root over the plaintext events.
fn pack_events<T: AsRef<[u8]>>(
    events: &[T],
    policy: &Policy,
    do_encrypt: bool,
    do_compress: bool,
) -> Result<(Vec<u8>, Blake2Hash, Blake2Hash), CoreError> {
    let mut payload = Vec::new();
    for event in events {
        let event = event.as_ref();
        if event.len() > MAX_EVENT_SIZE {
            return Err(CoreError::EventTooLarge {
                max: MAX_EVENT_SIZE,
                got: event.len(),
            });
        }
        payload.extend_from_slice(&(event.len() as u16).to_be_bytes());
        payload.extend_from_slice(event);
    }

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let root_hash = khash(&iv, &[crate::merkle::merkle_tree_hash(events).as_bytes()]);
    payload.extend_from_slice(&iv);

    if do_compress {
        payload = compress(&payload)?;
    }
    if do_encrypt {
        payload = encrypt(&policy.encrypt_key, &payload)?;
    }
    let payload_hash = policy.keyed_digest(&[&payload]);

    Ok((payload, payload_hash, root_hash))
}

/// Build a complete encoded block: header followed by payload.
pub fn encode_block<T: AsRef<[u8]>>(
    index: u64,
    len_prev: u64,
    time: u64,
    do_encrypt: bool,
    do_compress: bool,
    policy: &Policy,
    events: &[T],
    keypair: &Keypair,
) -> Result<Vec<u8>, CoreError> {
    let (payload, payload_hash, root_hash) = pack_events(events, policy, do_encrypt, do_compress)?;
    let len_cur = (BLOCK_HEADER_WIRE_SIZE + payload.len()) as u64;

    let input = header_hash_input(index, len_cur, len_prev, &payload_hash, do_encrypt, do_compress);
    let header_hash = policy.keyed_digest(&[&input]);
    let signature = keypair.sign(&signed_message(&header_hash, &root_hash, time));

    let header = BlockHeader {
        index,
        len_cur,
        len_prev,
        time,
        payload_hash,
        header_hash,
        root_hash,
        signature,
        encrypted: do_encrypt,
        compressed: do_compress,
    };

    let mut encoded = Vec::with_capacity(len_cur as usize);
    encoded.extend_from_slice(&header.encode());
    encoded.extend_from_slice(&payload);
    Ok(encoded)
}

/// Check a wire payload against the keyed digest in its header.
pub fn check_payload_hash(payload: &[u8], policy: &Policy, header: &BlockHeader) -> bool {
    policy.keyed_digest(&[payload]).ct_eq(&header.payload_hash)
}

/// Decode a block payload back into its events and IV.
///
/// `kdf_pub` and `secret` are the device's encryption keypair; they are
/// only consulted when the header's encrypted flag is set.
pub fn decode_block_payload(
    payload: &[u8],
    kdf_pub: &X25519PublicKey,
    secret: &X25519SecretKey,
    policy: &Policy,
    header: &BlockHeader,
) -> Result<(Vec<Bytes>, Iv), CoreError> {
    if payload.len() as u64 != header.payload_len() {
        return Err(CoreError::PayloadLength {
            expected: header.payload_len(),
            got: payload.len() as u64,
        });
    }
    if !check_payload_hash(payload, policy, header) {
        return Err(CoreError::PayloadHashMismatch);
    }

    let mut buf = payload.to_vec();
    if header.encrypted {
        buf = decrypt(&buf, kdf_pub, secret)?;
    }
    if header.compressed {
        buf = decompress(&buf)?;
    }
    if buf.len() < IV_SIZE {
        return Err(CoreError::TruncatedPayload);
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&buf[buf.len() - IV_SIZE..]);
    let body_len = buf.len() - IV_SIZE;

    let body = Bytes::from(buf);
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset < body_len {
        if body_len - offset < 2 {
            return Err(CoreError::MalformedEvents);
        }
        let len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
        offset += 2;
        if len > body_len - offset {
            return Err(CoreError::MalformedEvents);
        }
        events.push(body.slice(offset..offset + len));
        offset += len;
    }

    Ok((events, Iv::from_bytes(iv)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_keygen;
    use crate::policy::PolicyParams;

    fn fixture() -> (Keypair, X25519PublicKey, X25519SecretKey, Policy) {
        let keypair = Keypair::generate();
        let (pub_key, secret) = encrypt_keygen();
        let policy = Policy::create(
            &keypair,
            pub_key,
            PolicyParams {
                timeout: 10,
                space: 1 << 20,
                time: 2,
            },
        );
        (keypair, pub_key, secret, policy)
    }

    fn sample_events() -> Vec<Vec<u8>> {
        vec![vec![], vec![0x12, 0x34], vec![0x34, 0x12, 0x56]]
    }

    #[test]
    fn test_block_roundtrip_all_flag_combinations() {
        let (keypair, pub_key, secret, policy) = fixture();
        let mut len_prev = 0u64;
        for (i, (enc, comp)) in [(false, false), (false, true), (true, false), (true, true)]
            .into_iter()
            .enumerate()
        {
            let events = sample_events();
            let block =
                encode_block(i as u64, len_prev, 7, enc, comp, &policy, &events, &keypair)
                    .unwrap();

            let header = BlockHeader::decode(&block, &policy).unwrap();
            assert_eq!(header.index, i as u64);
            assert_eq!(header.len_prev, len_prev);
            assert_eq!(header.len_cur, block.len() as u64);
            assert_eq!(header.encrypted, enc);
            assert_eq!(header.compressed, comp);

            let (decoded, _) = decode_block_payload(
                &block[BLOCK_HEADER_WIRE_SIZE..],
                &pub_key,
                &secret,
                &policy,
                &header,
            )
            .unwrap();
            assert_eq!(decoded.len(), events.len());
            for (got, want) in decoded.iter().zip(events.iter()) {
                assert_eq!(got.as_ref(), want.as_slice());
            }

            len_prev = block.len() as u64;
        }
    }

    #[test]
    fn test_empty_and_zero_length_events() {
        let (keypair, pub_key, secret, policy) = fixture();
        for events in [Vec::new(), vec![Vec::new()]] {
            let block = encode_block(0, 0, 1, true, true, &policy, &events, &keypair).unwrap();
            let header = BlockHeader::decode(&block, &policy).unwrap();
            let (decoded, _) = decode_block_payload(
                &block[BLOCK_HEADER_WIRE_SIZE..],
                &pub_key,
                &secret,
                &policy,
                &header,
            )
            .unwrap();
            assert_eq!(decoded.len(), events.len());
        }
    }

    #[test]
    fn test_oversize_event_rejected() {
        let (keypair, _, _, policy) = fixture();
        let events = vec![vec![0u8; MAX_EVENT_SIZE + 1]];
        assert!(matches!(
            encode_block(0, 0, 1, false, false, &policy, &events, &keypair),
            Err(CoreError::EventTooLarge { .. })
        ));
    }

    #[test]
    fn test_same_inputs_differ_by_iv() {
        let (keypair, _, _, policy) = fixture();
        let events = sample_events();
        let a = encode_block(3, 100, 7, false, false, &policy, &events, &keypair).unwrap();
        let b = encode_block(3, 100, 7, false, false, &policy, &events, &keypair).unwrap();

        let ha = BlockHeader::decode(&a, &policy).unwrap();
        let hb = BlockHeader::decode(&b, &policy).unwrap();
        assert_eq!(ha.index, hb.index);
        assert_eq!(ha.len_cur, hb.len_cur);
        assert_eq!(ha.len_prev, hb.len_prev);
        assert_eq!(ha.time, hb.time);
        assert_ne!(ha.root_hash, hb.root_hash);
        assert_ne!(ha.payload_hash, hb.payload_hash);
        assert_ne!(ha.header_hash, hb.header_hash);
        assert_ne!(ha.signature, hb.signature);
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (keypair, _, _, policy) = fixture();
        let events = sample_events();
        let mut block = encode_block(0, 0, 7, false, false, &policy, &events, &keypair).unwrap();
        // Flip a bit in the index field: the signature still verifies
        // (it does not cover the index directly) but the header hash
        // probe fails for every flag combination.
        block[7] ^= 0x01;
        assert!(matches!(
            BlockHeader::decode(&block, &policy),
            Err(CoreError::HeaderHashMismatch)
        ));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (keypair, _, _, policy) = fixture();
        let events = sample_events();
        let mut block = encode_block(0, 0, 7, false, false, &policy, &events, &keypair).unwrap();
        block[32 + 3 * HASH_SIZE] ^= 0x01;
        assert!(matches!(
            BlockHeader::decode(&block, &policy),
            Err(CoreError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let (_, _, _, policy) = fixture();
        let other = Keypair::generate();
        let block =
            encode_block(0, 0, 7, false, false, &policy, &sample_events(), &other).unwrap();
        assert!(BlockHeader::decode(&block, &policy).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let (keypair, pub_key, secret, policy) = fixture();
        let events = sample_events();
        let block = encode_block(0, 0, 7, false, false, &policy, &events, &keypair).unwrap();
        let header = BlockHeader::decode(&block, &policy).unwrap();

        let mut payload = block[BLOCK_HEADER_WIRE_SIZE..].to_vec();
        payload[0] ^= 0x01;
        assert!(!check_payload_hash(&payload, &policy, &header));
        assert!(matches!(
            decode_block_payload(&payload, &pub_key, &secret, &policy, &header),
            Err(CoreError::PayloadHashMismatch)
        ));
    }

    #[test]
    fn test_payload_length_mismatch_rejected() {
        let (keypair, pub_key, secret, policy) = fixture();
        let block =
            encode_block(0, 0, 7, false, false, &policy, &sample_events(), &keypair).unwrap();
        let header = BlockHeader::decode(&block, &policy).unwrap();
        assert!(matches!(
            decode_block_payload(
                &block[BLOCK_HEADER_WIRE_SIZE..block.len() - 1],
                &pub_key,
                &secret,
                &policy,
                &header,
            ),
            Err(CoreError::PayloadLength { .. })
        ));
    }
}
