use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::buffers::Buffers;
use crate::decoder::FrameConfig;
use crate::error::{FrameError, Result};
use crate::marker::MarkerMatcher;
use crate::varint::{put_varint_u32, varint_u32_len, VarintAccumulator};

/// Magic number opening every stream packet: "CRPK".
pub const PACKET_MAGIC: [u8; 4] = *b"CRPK";

/// Encode one packet (magic + varint length + payload) into `dst`.
pub fn encode_packet(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(PACKET_MAGIC.len() + varint_u32_len(len) + payload.len());
    dst.put_slice(&PACKET_MAGIC);
    put_varint_u32(dst, len);
    dst.put_slice(payload);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum State {
    SeekMagic,
    ReadLength(VarintAccumulator),
    ReadPayload(usize),
}

/// Recovers magic-prefixed packets whose length is a LEB128 varint.
///
/// Same buffering contract as [`FrameDecoder`](crate::FrameDecoder); small
/// payloads cost one length byte instead of four.
#[derive(Debug)]
pub struct StreamPacketDecoder {
    buffers: Buffers,
    matcher: MarkerMatcher,
    state: State,
    config: FrameConfig,
}

impl StreamPacketDecoder {
    /// Create a decoder with default limits.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a decoder with explicit limits.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buffers: Buffers::new(),
            matcher: MarkerMatcher::new(PACKET_MAGIC),
            state: State::SeekMagic,
            config,
        }
    }

    /// Build the wire bytes for one payload.
    pub fn construct(payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        encode_packet(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append `chunk` and emit every packet it completes, in order.
    pub fn push(&mut self, chunk: impl Into<Bytes>, mut on_data: impl FnMut(Bytes)) -> Result<()> {
        self.buffers.push(chunk);
        loop {
            match self.next_packet() {
                Ok(Some(payload)) => on_data(payload),
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.reset();
                    return Err(err);
                }
            }
        }
    }

    /// Bytes held for a packet that has not completed yet.
    pub fn buffered(&self) -> usize {
        self.buffers.len()
    }

    /// Drop all buffered bytes and partial state.
    pub fn reset(&mut self) {
        self.buffers.clear();
        self.matcher.reset();
        self.state = State::SeekMagic;
    }

    fn next_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::SeekMagic => {
                    if !self.matcher.seek(&mut self.buffers) {
                        return Ok(None);
                    }
                    self.state = State::ReadLength(VarintAccumulator::default());
                }
                State::ReadLength(mut accumulator) => {
                    let mut consumed = 0;
                    let mut length = None;
                    for byte in self.buffers.cursor(0)? {
                        consumed += 1;
                        if let Some(value) = accumulator.feed(byte)? {
                            length = Some(value as usize);
                            break;
                        }
                    }
                    self.buffers.advance(consumed)?;
                    let Some(len) = length else {
                        self.state = State::ReadLength(accumulator);
                        return Ok(None);
                    };
                    if len > self.config.max_payload_size {
                        return Err(FrameError::PayloadTooLarge {
                            size: len,
                            max: self.config.max_payload_size,
                        });
                    }
                    self.state = State::ReadPayload(len);
                }
                State::ReadPayload(len) => {
                    if self.buffers.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffers.split_to(len)?.to_bytes();
                    self.state = State::SeekMagic;
                    trace!(len, "packet decoded");
                    return Ok(Some(payload));
                }
            }
        }
    }
}

impl Default for StreamPacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut StreamPacketDecoder, chunk: &[u8]) -> Vec<Bytes> {
        let mut packets = Vec::new();
        decoder
            .push(Bytes::copy_from_slice(chunk), |packet| packets.push(packet))
            .unwrap();
        packets
    }

    #[test]
    fn small_payload_uses_one_length_byte() {
        let wire = StreamPacketDecoder::construct(b"hi").unwrap();
        assert_eq!(&wire[..], b"CRPK\x02hi");
    }

    #[test]
    fn decodes_large_payload_byte_at_a_time() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let wire = StreamPacketDecoder::construct(&payload).unwrap();
        assert_eq!(wire[4], 0xe8, "1000 needs a two-byte varint");

        let mut decoder = StreamPacketDecoder::new();
        let mut packets = Vec::new();
        for byte in wire.iter() {
            packets.extend(feed(&mut decoder, &[*byte]));
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_ref(), payload.as_slice());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decodes_back_to_back_packets() {
        let mut wire = BytesMut::new();
        encode_packet(b"a", &mut wire).unwrap();
        encode_packet(b"CRPK inside", &mut wire).unwrap();
        encode_packet(b"c", &mut wire).unwrap();

        let mut decoder = StreamPacketDecoder::new();
        let packets = feed(&mut decoder, &wire);
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"CRPK inside"),
                Bytes::from_static(b"c")
            ]
        );
    }

    #[test]
    fn rejects_oversized_length() {
        let mut decoder =
            StreamPacketDecoder::with_config(FrameConfig::default().with_max_payload_size(1));
        let wire = StreamPacketDecoder::construct(b"xyz").unwrap();
        assert!(matches!(
            decoder.push(wire, |_| {}),
            Err(FrameError::PayloadTooLarge { size: 3, max: 1 })
        ));
    }

    #[test]
    fn rejects_malformed_length() {
        let mut decoder = StreamPacketDecoder::new();
        let result = decoder.push(&b"CRPK\xff\xff\xff\xff\xff\xff"[..], |_| {});
        assert!(matches!(result, Err(FrameError::MalformedVarint)));
    }
}
