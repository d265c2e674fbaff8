//! # Steady Relay
//!
//! The low-trust block store of a Steady deployment. Devices register a
//! [`steady_core::Policy`] and append signed, chained blocks; collectors
//! read them back and judge the relay by what it returns.
//!
//! The relay enforces exactly three things per slot: writes carry the
//! next expected index, blocks verify under the slot's policy, and the
//! retained bytes stay within the policy's space (oldest blocks are
//! evicted first). Detecting deletion, reordering, or stonewalling is
//! the collector's job, which is the point: the relay never needs to
//! be trusted.

mod error;
mod server;
mod slot;

pub use error::RelayError;
pub use server::Relay;
