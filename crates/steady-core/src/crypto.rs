//! Cryptographic primitives for Steady.
//!
//! Wraps BLAKE2b-256 hashing (plain and keyed), Ed25519 signing, and a
//! one-shot hybrid encryption (ephemeral-static X25519 + AES-256-GCM)
//! with strong types, plus LZ4 frame compression.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2b, Blake2bMac, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hex::FromHex;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{Read, Write};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::CoreError;

/// Hash output length in bytes.
pub const HASH_SIZE: usize = 32;

/// Keyed-hash keys longer than this are truncated (BLAKE2b key limit).
pub const KHASH_MAX_KEY: usize = 64;

/// Ed25519 verification key length in bytes.
pub const VERIFICATION_KEY_SIZE: usize = 32;

/// Ed25519 signing key material length in bytes (seed followed by the
/// verification key).
pub const SIGNING_KEY_SIZE: usize = 64;

/// Ed25519 detached signature length in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// X25519 key length in bytes (public and secret).
pub const X25519_KEY_SIZE: usize = 32;

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

/// A 32-byte BLAKE2b-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blake2Hash(pub [u8; HASH_SIZE]);

impl Blake2Hash {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time equality against another digest.
    pub fn ct_eq(&self, other: &Blake2Hash) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }

    /// Constant-time equality against a raw byte slice.
    ///
    /// The length of a digest is public, so a length mismatch returns
    /// false immediately.
    pub fn ct_eq_bytes(&self, other: &[u8]) -> bool {
        if other.len() != HASH_SIZE {
            return false;
        }
        self.0.as_slice().ct_eq(other).into()
    }
}

impl fmt::Debug for Blake2Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake2({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Blake2Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for Blake2Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Blake2Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Blake2Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = <[u8; HASH_SIZE]>::from_hex(&s).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// Hash the concatenation of `parts` with unkeyed BLAKE2b-256.
pub fn hash(parts: &[&[u8]]) -> Blake2Hash {
    let mut hasher = Blake2b256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    Blake2Hash(hasher.finalize().into())
}

/// Hash the concatenation of `parts` with keyed BLAKE2b-256.
///
/// Keys longer than [`KHASH_MAX_KEY`] bytes are truncated so the
/// operation is total.
pub fn khash(key: &[u8], parts: &[&[u8]]) -> Blake2Hash {
    let key = if key.len() > KHASH_MAX_KEY {
        &key[..KHASH_MAX_KEY]
    } else {
        key
    };
    let mut mac =
        Blake2bMac256::new_from_slice(key).expect("key is truncated to the BLAKE2b limit");
    for part in parts {
        Update::update(&mut mac, part);
    }
    Blake2Hash(mac.finalize_fixed().into())
}

/// A 32-byte Ed25519 verification key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey(pub [u8; VERIFICATION_KEY_SIZE]);

impl Ed25519PublicKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; VERIFICATION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; VERIFICATION_KEY_SIZE] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a detached signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Ed25519PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 64-byte Ed25519 detached signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; SIGNATURE_SIZE]);

impl Ed25519Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Ed25519Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Ed25519Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Ed25519Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = <[u8; SIGNATURE_SIZE]>::from_hex(&s).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// An Ed25519 keypair for signing policies and block headers.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Derive a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Restore from the 64-byte signing key material (seed followed by
    /// the verification key). Fails if the two halves are inconsistent.
    pub fn from_keypair_bytes(bytes: &[u8; SIGNING_KEY_SIZE]) -> Result<Self, CoreError> {
        let signing_key =
            SigningKey::from_keypair_bytes(bytes).map_err(|_| CoreError::InvalidSigningKey)?;
        Ok(Self { signing_key })
    }

    /// The 64-byte signing key material.
    pub fn to_keypair_bytes(&self) -> [u8; SIGNING_KEY_SIZE] {
        self.signing_key.to_keypair_bytes()
    }

    /// The verification key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message (deterministic).
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// An X25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct X25519PublicKey(pub [u8; X25519_KEY_SIZE]);

impl X25519PublicKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519Pub({})", &hex::encode(self.0)[..16])
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(pk: PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

/// An X25519 static secret key (32 bytes), used only for key agreement.
#[derive(Clone)]
pub struct X25519SecretKey([u8; X25519_KEY_SIZE]);

impl X25519SecretKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> X25519PublicKey {
        let secret = StaticSecret::from(self.0);
        X25519PublicKey::from(PublicKey::from(&secret))
    }

    fn diffie_hellman(&self, peer: &X25519PublicKey) -> [u8; 32] {
        let secret = StaticSecret::from(self.0);
        *secret.diffie_hellman(&peer.to_dalek()).as_bytes()
    }
}

impl fmt::Debug for X25519SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519Secret(..)")
    }
}

/// Generate a fresh X25519 keypair for payload encryption.
pub fn encrypt_keygen() -> (X25519PublicKey, X25519SecretKey) {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; X25519_KEY_SIZE];
    rng.fill_bytes(&mut bytes);
    let secret = X25519SecretKey::from_bytes(bytes);
    (secret.public_key(), secret)
}

/// Derive the AEAD key and nonce from the shared secret, the static
/// public key used for derivation, and the ephemeral public key.
fn derive_key_nonce(
    shared: &[u8; 32],
    kdf_pub: &X25519PublicKey,
    ephm_pub: &X25519PublicKey,
) -> ([u8; 32], [u8; 12]) {
    let key = hash(&[shared, kdf_pub.as_bytes(), ephm_pub.as_bytes(), b"key"]);
    let nonce_full = hash(&[shared, kdf_pub.as_bytes(), ephm_pub.as_bytes(), b"nonce"]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_full.as_bytes()[..12]);
    (*key.as_bytes(), nonce)
}

/// One-shot hybrid encryption to `peer`: ephemeral-static X25519, then
/// AES-256-GCM with the ephemeral public key as associated data. The
/// 32-byte ephemeral public key is appended to the ciphertext.
pub fn encrypt(peer: &X25519PublicKey, data: &[u8]) -> Result<Vec<u8>, CoreError> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephm_pub = X25519PublicKey::from(PublicKey::from(&ephemeral));
    let shared = *ephemeral.diffie_hellman(&peer.to_dalek()).as_bytes();
    let (key, nonce) = derive_key_nonce(&shared, peer, &ephm_pub);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CoreError::EncryptionFailed)?;
    let mut ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: data,
                aad: ephm_pub.as_bytes(),
            },
        )
        .map_err(|_| CoreError::EncryptionFailed)?;
    ct.extend_from_slice(ephm_pub.as_bytes());
    Ok(ct)
}

/// Decrypt a ciphertext produced by [`encrypt`].
///
/// `kdf_pub` is the static public key the sender encrypted to (it feeds
/// the key derivation), `secret` the matching secret key.
pub fn decrypt(
    ciphertext: &[u8],
    kdf_pub: &X25519PublicKey,
    secret: &X25519SecretKey,
) -> Result<Vec<u8>, CoreError> {
    if ciphertext.len() < X25519_KEY_SIZE {
        return Err(CoreError::ShortCiphertext);
    }
    let split = ciphertext.len() - X25519_KEY_SIZE;
    let mut ephm_bytes = [0u8; X25519_KEY_SIZE];
    ephm_bytes.copy_from_slice(&ciphertext[split..]);
    let ephm_pub = X25519PublicKey::from_bytes(ephm_bytes);

    let shared = secret.diffie_hellman(&ephm_pub);
    let (key, nonce) = derive_key_nonce(&shared, kdf_pub, &ephm_pub);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CoreError::DecryptionFailed)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext[..split],
                aad: ephm_pub.as_bytes(),
            },
        )
        .map_err(|_| CoreError::DecryptionFailed)
}

/// Compress data with the LZ4 frame format.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .map_err(|e| CoreError::Compress(e.to_string()))?;
    encoder.finish().map_err(|e| CoreError::Compress(e.to_string()))
}

/// Decompress an LZ4 frame.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    lz4_flex::frame::FrameDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CoreError::Decompress(e.to_string()))?;
    Ok(out)
}
