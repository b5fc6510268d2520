//! Per-deployment tuning for the retry/recovery timing, as distinct from
//! the protocol constants in [`crate::wire`] and [`crate::status`] that are
//! fixed by the wire format itself.

use std::time::Duration;

/// The hard-coded maximum number of status-assisted retries a single
/// in-flight control packet gets before the actor gives up with
/// `ControlTimeout`.
pub const MAX_CONTROL_RETRIES: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Per-send timeout on both the control and status channels.
    pub response_timeout: Duration,
    /// How many times the status prober will (re)send its request before
    /// giving up with a status timeout.
    pub status_attempts: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            status_attempts: 2,
        }
    }
}
