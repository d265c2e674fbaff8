//! # Steady Collector
//!
//! The verifying reader of a Steady deployment. A collector polls a
//! relay on a fixed cadence, classifies whatever comes back, and turns
//! it into two things: a stream of events (each verified one carrying
//! an audit-path [`Proof`]) and one [`Assessment`] per poll that says
//! whether the relay is behaving.
//!
//! The relay is never trusted. Dropped, reordered, duplicated, or
//! withheld blocks all leave fingerprints the assessment reports:
//! sequence gaps are red, silence past the policy timeout is yellow,
//! and deletion while space remained is red.

mod assessment;
mod collector;
mod config;
mod error;
mod proof;

pub use assessment::{
    Assessment, BlockHead, CollectorEvent, Finding, Overall, Proof, Unverified,
};
pub use collector::{Collector, State};
pub use config::{collector_path, CollectorConfig};
pub use error::CollectorError;
pub use proof::verify_event_origin;
