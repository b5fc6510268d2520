//! The decision table that turns a status-probe outcome, taken after an
//! in-flight control packet has timed out, into a concrete recovery
//! action.
//!
//! Invoked only once `probe_status()` (see [`crate::status`] for the wire
//! codec half of that and [`crate::engine`] for the retry loop around it)
//! has produced an outcome; this function itself performs no I/O and has
//! no notion of time.

use crate::error::ErrorCode;
use crate::status::Malformed;
use crate::wire;

/// What the single-flight engine should do next after a status probe
/// resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The target never saw the original request; resend the saved bytes.
    ResendRequest,
    /// The target processed the request but its reply was lost; ask it to
    /// retransmit.
    RequestRetransmitFromTarget,
    /// No recoverable interpretation of the status reply; fail the
    /// in-flight request with the given code.
    GiveUp(ErrorCode),
}

/// The outcome of a single `probe_status()` call.
pub type StatusOutcome = Result<(u32, u16), ProbeFailure>;

/// Why a status probe produced no usable reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Malformed,
}

impl From<Malformed> for ProbeFailure {
    fn from(_: Malformed) -> Self {
        ProbeFailure::Malformed
    }
}

/// Applies the recovery decision table to a status-probe outcome for the
/// in-flight packet stamped with `sent_id`.
pub fn decide(sent_id: u16, outcome: StatusOutcome) -> RecoveryAction {
    let (_, observed_next_id) = match outcome {
        Ok(pair) => pair,
        Err(ProbeFailure::Timeout) => return RecoveryAction::GiveUp(ErrorCode::StatusTimeout),
        Err(ProbeFailure::Malformed) => {
            return RecoveryAction::GiveUp(ErrorCode::MalformedStatus)
        }
    };

    if observed_next_id == sent_id {
        return RecoveryAction::ResendRequest;
    }

    if observed_next_id == wire::increment_id(sent_id) {
        return RecoveryAction::RequestRetransmitFromTarget;
    }

    RecoveryAction::GiveUp(ErrorCode::MalformedStatus)
}
