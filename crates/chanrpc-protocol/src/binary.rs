//! Little-endian primitive writer/reader shared by every codec.
//!
//! Strings and byte buffers are length-prefixed with a LEB128 varint.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chanrpc_frame::varint::{get_varint_u32, put_varint_u32};
use chanrpc_frame::FrameError;

use crate::error::{ProtocolError, Result};

/// Append-only message builder.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buf: BytesMut,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    pub fn varuint(&mut self, value: u32) {
        put_varint_u32(&mut self.buf, value);
    }

    /// Length-prefixed byte buffer.
    pub fn bytes(&mut self, value: &[u8]) -> Result<()> {
        self.varuint(length_prefix(value.len())?);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Length-prefixed UTF-8 string.
    pub fn string(&mut self, value: &str) -> Result<()> {
        self.bytes(value.as_bytes())
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        ProtocolError::Frame(FrameError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        })
    })
}

/// Sequential reader over one received message.
///
/// Byte-buffer fields are returned as [`Bytes`] slices of the message. They
/// share the message's allocation, are immutable and stay valid
/// independently of the reader.
#[derive(Debug, Clone)]
pub struct BinaryReader {
    data: Bytes,
}

impl BinaryReader {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.data.get_i32_le())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.data.get_i64_le())
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.data.get_f64_le())
    }

    pub fn varuint(&mut self) -> Result<u32> {
        match get_varint_u32(&self.data)? {
            Some((value, consumed)) => {
                self.data.advance(consumed);
                Ok(value)
            }
            None => Err(ProtocolError::UnexpectedEof {
                needed: self.data.len() + 1,
                remaining: self.data.len(),
            }),
        }
    }

    /// Length-prefixed byte buffer.
    pub fn bytes(&mut self) -> Result<Bytes> {
        let len = self.varuint()? as usize;
        self.need(len)?;
        Ok(self.data.split_to(len))
    }

    /// Length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    /// Take every byte not read yet.
    pub fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.data)
    }

    /// Fail unless every byte was consumed.
    pub fn expect_end(&self) -> Result<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(self.data.len()))
        }
    }

    fn need(&self, needed: usize) -> Result<()> {
        if self.data.len() < needed {
            return Err(ProtocolError::UnexpectedEof {
                needed,
                remaining: self.data.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian() {
        let mut writer = BinaryWriter::new();
        writer.u32(0x0403_0201);
        writer.i32(-2);
        writer.f64(1.5);
        let bytes = writer.finish();

        assert_eq!(&bytes[..4], &[1u8, 2, 3, 4]);
        let mut reader = BinaryReader::new(bytes);
        assert_eq!(reader.u32().unwrap(), 0x0403_0201);
        assert_eq!(reader.i32().unwrap(), -2);
        assert_eq!(reader.f64().unwrap(), 1.5);
        reader.expect_end().unwrap();
    }

    #[test]
    fn strings_carry_varint_length() {
        let mut writer = BinaryWriter::new();
        writer.string("héllo").unwrap();
        let bytes = writer.finish();
        assert_eq!(bytes[0], 6);

        let mut reader = BinaryReader::new(bytes);
        assert_eq!(reader.string().unwrap(), "héllo");
    }

    #[test]
    fn short_input_reports_eof() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[5, b'a', b'b']));
        assert!(matches!(
            reader.string(),
            Err(ProtocolError::UnexpectedEof { needed: 5, remaining: 2 })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[2, 0xff, 0xfe]));
        assert!(matches!(reader.string(), Err(ProtocolError::InvalidUtf8(_))));
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[1, 2]));
        reader.u8().unwrap();
        assert!(matches!(reader.expect_end(), Err(ProtocolError::TrailingBytes(1))));
    }
}
