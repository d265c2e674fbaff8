//! Persisted device files: the secret config and the resume state.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use steady_core::{Keypair, Policy, POLICY_WIRE_SIZE, SIGNING_KEY_SIZE};

use crate::error::DeviceError;

/// Path of the device secret file for a given stem.
pub fn device_path(stem: &str) -> PathBuf {
    PathBuf::from(format!("{stem}.device"))
}

/// Path of the device resume-state file for a given stem.
pub fn state_path(stem: &str) -> PathBuf {
    PathBuf::from(format!("{stem}.state"))
}

fn write_file(path: &Path, bytes: &[u8], mode: u32, create_new: bool) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// The device-only secret: signing key material and the signed policy.
///
/// Stored as `sk(64) || encoded_policy(184)`, mode 0400.
pub struct DeviceConfig {
    pub keypair: Keypair,
    pub policy: Policy,
}

impl DeviceConfig {
    /// Write the config; refuses to overwrite an existing file.
    pub fn write(&self, path: &Path) -> Result<(), DeviceError> {
        let mut buf = Zeroizing::new(Vec::with_capacity(SIGNING_KEY_SIZE + POLICY_WIRE_SIZE));
        buf.extend_from_slice(&self.keypair.to_keypair_bytes());
        buf.extend_from_slice(&self.policy.encode());
        write_file(path, &buf, 0o400, true)?;
        Ok(())
    }

    /// Read the config back from disk.
    pub fn read(path: &Path) -> Result<Self, DeviceError> {
        let data = Zeroizing::new(fs::read(path)?);
        if data.len() < SIGNING_KEY_SIZE + POLICY_WIRE_SIZE {
            return Err(DeviceError::ConfigTooSmall {
                expected: SIGNING_KEY_SIZE + POLICY_WIRE_SIZE,
                got: data.len(),
            });
        }
        let mut sk = Zeroizing::new([0u8; SIGNING_KEY_SIZE]);
        sk.copy_from_slice(&data[..SIGNING_KEY_SIZE]);
        let keypair = Keypair::from_keypair_bytes(&sk)?;
        let policy = Policy::decode(&data[SIGNING_KEY_SIZE..SIGNING_KEY_SIZE + POLICY_WIRE_SIZE])?;
        Ok(Self { keypair, policy })
    }
}

/// The resume state a device persists at clean shutdown:
/// `next_index(8) || time_prev(8) || len_prev(8)`, big-endian, mode 0600.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub next_index: u64,
    pub time_prev: u64,
    pub len_prev: u64,
}

impl DeviceState {
    /// Encoded length on disk.
    pub const SIZE: usize = 24;

    /// The state of a device that has never shipped a block.
    pub fn initial(policy: &Policy) -> Self {
        Self {
            next_index: 0,
            time_prev: policy.time,
            len_prev: 0,
        }
    }

    /// Read the state file.
    pub fn read(path: &Path) -> Result<Self, DeviceError> {
        let data = fs::read(path)?;
        if data.len() < Self::SIZE {
            return Err(DeviceError::ConfigTooSmall {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        let u64_at = |o: usize| u64::from_be_bytes(data[o..o + 8].try_into().expect("8 bytes"));
        Ok(Self {
            next_index: u64_at(0),
            time_prev: u64_at(8),
            len_prev: u64_at(16),
        })
    }

    /// Write the state file atomically: a temp file in the same
    /// directory is renamed over the target.
    pub fn write(&self, path: &Path) -> Result<(), DeviceError> {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.next_index.to_be_bytes());
        buf[8..16].copy_from_slice(&self.time_prev.to_be_bytes());
        buf[16..24].copy_from_slice(&self.len_prev.to_be_bytes());

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_file(&tmp, &buf, 0o600, false)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
