use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::decoder::{encode_frame, FrameConfig, FrameDecoder};
use crate::error::{FrameError, Result};

/// `tokio_util` codec for indicator-delimited frames.
///
/// Decoding drains the read buffer into a [`FrameDecoder`] on every call, so
/// partial frames live in the decoder's chunk aggregator rather than in the
/// `BytesMut` owned by `FramedRead`.
#[derive(Debug, Default)]
pub struct FrameCodec {
    decoder: FrameDecoder,
    ready: VecDeque<Bytes>,
}

impl FrameCodec {
    /// Create a codec with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with explicit limits.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            decoder: FrameDecoder::with_config(config),
            ready: VecDeque::new(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if !src.is_empty() {
            let chunk = src.split().freeze();
            let ready = &mut self.ready;
            self.decoder.push(chunk, |frame| ready.push_back(frame))?;
        }
        Ok(self.ready.pop_front())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if self.decoder.is_idle() {
            Ok(None)
        } else {
            self.decoder.reset();
            Err(FrameError::ConnectionClosed)
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_queued_frames_one_per_call() {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut src).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut src).unwrap();

        assert_eq!(codec.decode(&mut src).unwrap().unwrap().as_ref(), b"one");
        assert!(src.is_empty());
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().as_ref(), b"two");
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::new();
        codec.encode(Bytes::from_static(b"truncated"), &mut src).unwrap();
        src.truncate(src.len() - 3);

        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut src),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn eof_between_frames_is_clean() {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::new();
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
    }
}
