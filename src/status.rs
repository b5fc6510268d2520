//! The status-port sub-protocol: a fixed 64-byte request and a fixed-layout
//! reply used to learn a target's expected next packet id.
//!
//! These are pure codec functions. The retry/timeout loop that drives them
//! (issuing the actual probe) lives in [`crate::engine`], not here, so
//! this module stays a handful of trivially unit-testable functions.

const STATUS_WORD: u32 = 0x200000F1;
const STATUS_WORD_COUNT: usize = 16;
const NEXT_ID_MARKER: u8 = 0x20;
const NEXT_ID_TYPE_BYTE: u8 = 0xF0;

/// Size in bytes of the status request datagram.
pub const REQUEST_LEN: usize = STATUS_WORD_COUNT * 4;

/// Builds the 64-byte status request: sixteen repeats of the big-endian
/// word `0x200000F1`.
pub fn build_request() -> [u8; REQUEST_LEN] {
    let mut out = [0u8; REQUEST_LEN];
    for chunk in out.chunks_exact_mut(4) {
        chunk.copy_from_slice(&STATUS_WORD.to_be_bytes());
    }
    out
}

/// A status reply did not match the fixed layout this protocol expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed status reply")]
pub struct Malformed;

/// Parses a status reply, extracting the buffer count and the target's
/// next expected packet id.
///
/// Layout: 4-byte marker (`0x200000F1`), 4 ignored bytes, big-endian
/// `u32` buffer count, a `0x20` marker byte, a big-endian `u16` next id, a
/// `0xF0` type byte, then arbitrary trailing bytes.
pub fn parse_reply(bytes: &[u8]) -> Result<(u32, u16), Malformed> {
    if bytes.len() < 16 {
        return Err(Malformed);
    }

    if u32::from_be_bytes(bytes[0..4].try_into().unwrap()) != STATUS_WORD {
        return Err(Malformed);
    }

    let nr_buffers = u32::from_be_bytes(bytes[8..12].try_into().unwrap());

    if bytes[12] != NEXT_ID_MARKER {
        return Err(Malformed);
    }

    let next_id = u16::from_be_bytes(bytes[13..15].try_into().unwrap());

    if bytes[15] != NEXT_ID_TYPE_BYTE {
        return Err(Malformed);
    }

    Ok((nr_buffers, next_id))
}
