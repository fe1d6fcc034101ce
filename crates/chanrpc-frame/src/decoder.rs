use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::buffers::Buffers;
use crate::error::{FrameError, Result};
use crate::marker::MarkerMatcher;

/// Frame indicator: CR LF CR LF.
pub const INDICATOR: [u8; 4] = *b"\r\n\r\n";

/// Frame header: indicator (4) + little-endian payload length (4).
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Limits applied while decoding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl FrameConfig {
    /// Override the maximum payload size.
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Encode one frame into `dst`.
///
/// Wire format:
/// ```text
/// ┌────────────────┬─────────────┬──────────────────┐
/// │ Indicator (4B) │ Length      │ Payload          │
/// │ \r \n \r \n    │ (4B LE u32) │ (Length bytes)   │
/// └────────────────┴─────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&INDICATOR);
    dst.put_u32_le(len);
    dst.put_slice(payload);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekIndicator,
    ReadLength,
    ReadPayload(usize),
}

/// Recovers indicator-delimited frames from an arbitrarily split byte stream.
///
/// Pushed chunks are kept in a [`Buffers`] aggregator without copying. The
/// indicator is only searched for between frames; once a length is read the
/// payload is consumed by count, so indicator bytes inside a payload are
/// harmless.
#[derive(Debug)]
pub struct FrameDecoder {
    buffers: Buffers,
    matcher: MarkerMatcher,
    state: State,
    config: FrameConfig,
}

impl FrameDecoder {
    /// Create a decoder with default limits.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a decoder with explicit limits.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buffers: Buffers::new(),
            matcher: MarkerMatcher::new(INDICATOR),
            state: State::SeekIndicator,
            config,
        }
    }

    /// Build the wire bytes for one payload.
    pub fn construct(payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        encode_frame(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append `chunk` and emit every frame it completes, in order.
    ///
    /// On error the decoder drops its buffered bytes; the stream it was
    /// reading should be treated as corrupt.
    pub fn push(&mut self, chunk: impl Into<Bytes>, mut on_data: impl FnMut(Bytes)) -> Result<()> {
        self.buffers.push(chunk);
        loop {
            match self.next_frame() {
                Ok(Some(payload)) => on_data(payload),
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.reset();
                    return Err(err);
                }
            }
        }
    }

    /// Bytes held for a frame that has not completed yet.
    pub fn buffered(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the decoder is between frames with nothing pending.
    pub fn is_idle(&self) -> bool {
        self.state == State::SeekIndicator && self.matcher.matched() == 0 && self.buffers.is_empty()
    }

    /// Drop all buffered bytes and partial state.
    pub fn reset(&mut self) {
        self.buffers.clear();
        self.matcher.reset();
        self.state = State::SeekIndicator;
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::SeekIndicator => {
                    if !self.matcher.seek(&mut self.buffers) {
                        return Ok(None);
                    }
                    self.state = State::ReadLength;
                }
                State::ReadLength => {
                    if self.buffers.len() < 4 {
                        return Ok(None);
                    }
                    let raw = self.buffers.split_to(4)?.to_bytes();
                    let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
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
                    self.state = State::SeekIndicator;
                    trace!(len, "frame decoded");
                    return Ok(Some(payload));
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        decoder
            .push(Bytes::copy_from_slice(chunk), |frame| frames.push(frame))
            .unwrap();
        frames
    }

    #[test]
    fn construct_writes_header() {
        let wire = FrameDecoder::construct(b"hello").unwrap();
        assert_eq!(&wire[..4], b"\r\n\r\n");
        assert_eq!(&wire[4..8], &5u32.to_le_bytes());
        assert_eq!(&wire[8..], b"hello");
    }

    #[test]
    fn decodes_single_frame() {
        let mut decoder = FrameDecoder::new();
        let wire = FrameDecoder::construct(b"hello").unwrap();
        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn decodes_byte_at_a_time() {
        let mut decoder = FrameDecoder::new();
        let wire = FrameDecoder::construct(b"split payload").unwrap();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(decode_all(&mut decoder, &[*byte]));
        }
        assert_eq!(frames, vec![Bytes::from_static(b"split payload")]);
    }

    #[test]
    fn decodes_multiple_frames_in_one_push() {
        let mut decoder = FrameDecoder::new();
        let mut wire = BytesMut::new();
        encode_frame(b"first", &mut wire).unwrap();
        encode_frame(b"", &mut wire).unwrap();
        encode_frame(b"third", &mut wire).unwrap();

        let frames = decode_all(&mut decoder, &wire);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"first"),
                Bytes::new(),
                Bytes::from_static(b"third")
            ]
        );
    }

    #[test]
    fn keeps_leftover_for_next_push() {
        let mut decoder = FrameDecoder::new();
        let mut wire = BytesMut::new();
        encode_frame(b"one", &mut wire).unwrap();
        encode_frame(b"two", &mut wire).unwrap();
        let cut = wire.len() - 2;

        assert_eq!(decode_all(&mut decoder, &wire[..cut]), vec![Bytes::from_static(b"one")]);
        assert!(decoder.buffered() > 0);
        assert_eq!(decode_all(&mut decoder, &wire[cut..]), vec![Bytes::from_static(b"two")]);
    }

    #[test]
    fn indicator_inside_payload_does_not_desync() {
        let mut decoder = FrameDecoder::new();
        let payload = b"a\r\n\r\nb\r\n\r\n";
        let wire = FrameDecoder::construct(payload).unwrap();
        let mut frames = decode_all(&mut decoder, &wire);
        frames.extend(decode_all(&mut decoder, &FrameDecoder::construct(b"next").unwrap()));
        assert_eq!(frames, vec![Bytes::from_static(payload), Bytes::from_static(b"next")]);
    }

    #[test]
    fn skips_garbage_before_indicator() {
        let mut decoder = FrameDecoder::new();
        let mut wire = BytesMut::from(&b"noise\r"[..]);
        encode_frame(b"data", &mut wire).unwrap();
        assert_eq!(decode_all(&mut decoder, &wire), vec![Bytes::from_static(b"data")]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut decoder = FrameDecoder::with_config(FrameConfig::default().with_max_payload_size(4));
        let wire = FrameDecoder::construct(b"too long").unwrap();
        let result = decoder.push(wire, |_| {});
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 8, max: 4 })
        ));
        assert!(decoder.is_idle());
    }
}
