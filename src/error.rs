//! The upstream error-code contract and the one structured error type the
//! device client actually returns as a `Result` (socket setup failure;
//! everything downstream of that is delivered to a requester, not returned).

use std::io;
use std::net::Ipv4Addr;

/// The fixed 16-bit error code delivered alongside every reply, per the
/// downstream delivery contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    ControlTimeout = 1,
    StatusTimeout = 2,
    MalformedStatus = 3,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Failure to bring up a target's actor, surfaced by the registry to the
/// caller of `get_actor` rather than delivered upstream.
#[derive(Debug, thiserror::Error)]
#[error("failed to start device client for {ipv4}:{port}")]
pub struct StartError {
    pub ipv4: Ipv4Addr,
    pub port: u16,
    #[source]
    pub source: io::Error,
}

/// A request could not be submitted because the target's actor task had
/// already ended (process shutdown; see the best-effort shutdown path in
/// the concurrency model).
#[derive(Debug, thiserror::Error)]
#[error("device client actor for {ipv4}:{port} is no longer running")]
pub struct ActorGone {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}
