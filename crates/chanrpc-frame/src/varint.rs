//! Unsigned LEB128 integers: seven bits per byte, low groups first, high bit
//! set on every byte except the last.

use bytes::BufMut;

use crate::error::{FrameError, Result};

/// Maximum encoded width of a `u32`.
pub const MAX_VARINT32_LEN: usize = 5;

/// Append `value` to `dst`.
pub fn put_varint_u32(dst: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `value` occupies once encoded.
pub fn varint_u32_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Decode from the front of `src`, returning the value and bytes consumed.
///
/// `Ok(None)` means `src` ends before the varint does.
pub fn get_varint_u32(src: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut accumulator = VarintAccumulator::default();
    for (index, byte) in src.iter().enumerate() {
        if let Some(value) = accumulator.feed(*byte)? {
            return Ok(Some((value, index + 1)));
        }
    }
    Ok(None)
}

/// Incremental varint reader for byte-at-a-time decoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintAccumulator {
    value: u32,
    shift: u32,
}

impl VarintAccumulator {
    /// Feed one byte; returns the value once its last byte arrives.
    pub fn feed(&mut self, byte: u8) -> Result<Option<u32>> {
        if self.shift >= 32 || (self.shift == 28 && byte & 0x70 != 0) {
            return Err(FrameError::MalformedVarint);
        }
        self.value |= u32::from(byte & 0x7f) << self.shift;
        if byte & 0x80 == 0 {
            let value = self.value;
            *self = Self::default();
            return Ok(Some(value));
        }
        self.shift += 7;
        Ok(None)
    }

    /// Forget any partially read value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
