//! Per-target device-client actor for the IPbus 2.0 UDP control protocol.
//!
//! One actor mediates all traffic between many concurrent requesters and a
//! single hardware target (identified by IPv4 address and UDP control
//! port). [`wire`] and [`status`] are the pure wire codecs; [`retry`] is the
//! pure recovery decision table; [`engine`] composes them into a sans-IO
//! single-flight state machine; [`actor`] drives that engine with a real
//! socket and timer; [`registry`] is the idempotent get-or-create map from
//! target to running actor.

mod actor;
mod config;
mod engine;
mod error;
mod registry;
mod retry;
mod sleep;
mod socket;
mod status;
mod wire;

#[cfg(feature = "proptest")]
pub mod proptest;

pub use actor::{start, ActorHandle};
pub use config::Config;
pub use engine::{Command, Delivery, Port, Requester};
pub use error::{ActorGone, ErrorCode, StartError};
pub use registry::Registry;
pub use wire::{Endianness, Version};
