//! Zig-zag signed variable-length integers.
//!
//! Used throughout the extra pool file: vertex deltas, pool offset deltas,
//! counts, and tags are all signed quantities that are usually small. The
//! encoding is 7 payload bits per byte, least-significant group first, with
//! the high bit as a continuation flag; the sign is folded in zig-zag style
//! so small negative values stay short.

use crate::error::{Result, StoreError};
use bytes::BufMut;

const MAX_ENCODED_LEN: usize = 10;

/// Append the encoding of `value` to `buf`.
pub fn write_signed(buf: &mut impl BufMut, value: i64) {
    let mut zz = ((value << 1) ^ (value >> 63)) as u64;

    loop {
        let byte = (zz & 0x7f) as u8;
        zz >>= 7;
        if zz == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode one signed varint from `buf` starting at `*pos`, advancing `*pos`
/// past it. A truncated or over-long encoding is reported as a pool
/// consistency error at the starting offset.
pub fn read_signed(buf: &[u8], pos: &mut usize) -> Result<i64> {
    let start = *pos;
    let mut zz: u64 = 0;
    let mut shift = 0;

    loop {
        let byte = *buf.get(*pos).ok_or(StoreError::Pool {
            offset: start as u64,
        })?;
        *pos += 1;

        zz |= ((byte & 0x7f) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if *pos - start >= MAX_ENCODED_LEN {
            return Err(StoreError::Pool {
                offset: start as u64,
            });
        }
    }

    Ok(((zz >> 1) as i64) ^ -((zz & 1) as i64))
}
