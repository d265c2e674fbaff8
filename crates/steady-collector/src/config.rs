//! The collector credentials file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use steady_core::{
    Ed25519PublicKey, Policy, X25519PublicKey, X25519SecretKey, POLICY_WIRE_SIZE,
    VERIFICATION_KEY_SIZE, X25519_KEY_SIZE,
};

use crate::error::CollectorError;

/// Path of the collector credentials file for a given stem.
pub fn collector_path(stem: &str) -> PathBuf {
    PathBuf::from(format!("{stem}.collector"))
}

/// Everything a collector needs to read and judge one device's log:
/// the decryption keypair, the device's verification key, and the
/// policy.
///
/// Stored as `pub(32) || priv(32) || vk(32) || encoded_policy(184)`,
/// mode 0400.
#[derive(Clone)]
pub struct CollectorConfig {
    pub pub_key: X25519PublicKey,
    pub priv_key: X25519SecretKey,
    pub vk: Ed25519PublicKey,
    pub policy: Policy,
}

impl CollectorConfig {
    /// Write the credentials file.
    pub fn write(&self, path: &Path) -> Result<(), CollectorError> {
        let mut buf = Vec::with_capacity(3 * X25519_KEY_SIZE + POLICY_WIRE_SIZE);
        buf.extend_from_slice(self.pub_key.as_bytes());
        buf.extend_from_slice(self.priv_key.as_bytes());
        buf.extend_from_slice(self.vk.as_bytes());
        buf.extend_from_slice(&self.policy.encode());

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o400);
        }
        let mut file = options.open(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read the credentials file back.
    pub fn read(path: &Path) -> Result<Self, CollectorError> {
        let data = fs::read(path)?;
        let expected = 2 * X25519_KEY_SIZE + VERIFICATION_KEY_SIZE + POLICY_WIRE_SIZE;
        if data.len() < expected {
            return Err(CollectorError::ConfigTooSmall {
                expected,
                got: data.len(),
            });
        }

        let mut pub_key = [0u8; X25519_KEY_SIZE];
        pub_key.copy_from_slice(&data[..X25519_KEY_SIZE]);
        let mut priv_key = [0u8; X25519_KEY_SIZE];
        priv_key.copy_from_slice(&data[X25519_KEY_SIZE..2 * X25519_KEY_SIZE]);
        let mut vk = [0u8; VERIFICATION_KEY_SIZE];
        vk.copy_from_slice(&data[2 * X25519_KEY_SIZE..2 * X25519_KEY_SIZE + VERIFICATION_KEY_SIZE]);
        let policy = Policy::decode(&data[2 * X25519_KEY_SIZE + VERIFICATION_KEY_SIZE..expected])?;

        Ok(Self {
            pub_key: X25519PublicKey::from_bytes(pub_key),
            priv_key: X25519SecretKey::from_bytes(priv_key),
            vk: Ed25519PublicKey::from_bytes(vk),
            policy,
        })
    }
}
