//! Reusable `proptest` strategies for this crate's wire types, gated behind
//! the `proptest` feature so downstream property tests can build on them
//! without duplicating header-construction boilerplate.

use proptest::prelude::*;

/// A valid packet id: the reserved space excludes zero.
pub fn packet_id() -> impl Strategy<Value = u16> {
    1..=0xFFFFu16
}

/// A well-formed, big-endian v2 control/status/resend header carrying
/// `id`, followed by an arbitrary payload.
pub fn v2_big_endian_request(id: u16) -> impl Strategy<Value = Vec<u8>> {
    let [hi, lo] = id.to_be_bytes();
    any::<Vec<u8>>().prop_map(move |payload| {
        let mut out = vec![0x20, hi, lo, 0xF0];
        out.extend(payload);
        out
    })
}

/// A well-formed, little-endian (byte-swapped) v2 header carrying `id`,
/// followed by an arbitrary payload.
pub fn v2_little_endian_request(id: u16) -> impl Strategy<Value = Vec<u8>> {
    let [lo, hi] = id.to_le_bytes();
    any::<Vec<u8>>().prop_map(move |payload| {
        let mut out = vec![0xF0, lo, hi, 0x20];
        out.extend(payload);
        out
    })
}

/// A well-formed status reply carrying `nr_buffers` and `next_id`.
pub fn status_reply(nr_buffers: u32, next_id: u16) -> impl Strategy<Value = Vec<u8>> {
    Just(()).prop_map(move |()| {
        let mut out = vec![0x20, 0x00, 0x00, 0xF1];
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&nr_buffers.to_be_bytes());
        out.push(0x20);
        out.extend_from_slice(&next_id.to_be_bytes());
        out.push(0xF0);
        out
    })
}
