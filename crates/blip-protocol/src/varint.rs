//! Unsigned LEB128 varints, the integer encoding used throughout the
//! frame header and ACK payloads.

use blip_core::{ErrorKind, Result};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Appends `value` to `buf` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut impl BufMut, value: u64) {
    buf.put_u64_varint(value);
}

/// Reads an unsigned LEB128 varint, advancing `buf` past it.
pub fn try_get_uvarint(buf: &mut impl Buf) -> Result<u64> {
    buf.try_get_u64_varint().map_err(|_| ErrorKind::Protocol("malformed varint"))
}

/// Returns the encoded size of `value` in bytes (1..=10).
pub fn uvarint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros().max(0) as usize;
    std::cmp::max(1, bits.div_ceil(7))
}
