//! # Steady Device
//!
//! The logging side of Steady: a small process that batches events into
//! signed, chained blocks and ships them to a relay it does not trust.
//!
//! A device is provisioned once with [`provision`], which registers its
//! [`steady_core::Policy`] at the relay and writes the secret file.
//! [`Device::load`] resumes from disk, reconciles against the relay's
//! status reply (refusing rollbacks), and runs the bounded
//! packer/sender pipeline until [`Device::close`].

mod config;
mod device;
mod error;

pub use config::{device_path, state_path, DeviceConfig, DeviceState};
pub use device::{provision, Device, DeviceOptions};
pub use error::DeviceError;
