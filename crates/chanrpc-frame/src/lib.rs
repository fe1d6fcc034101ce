//! Chunk-aware byte buffering and frame recovery.
//!
//! Network reads rarely line up with message boundaries. This crate keeps
//! incoming chunks in a [`Buffers`] aggregator and recovers whole frames with
//! one of two byte-wise decoders:
//! - [`FrameDecoder`]: `\r\n\r\n` indicator, 4-byte little-endian length
//! - [`StreamPacketDecoder`]: 4-byte magic, LEB128 varint length
//!
//! [`framed_transport`] wires the indicator framing onto any tokio byte
//! stream and yields a message [`Transport`](chanrpc_transport::Transport).

pub mod buffers;
pub mod codec;
pub mod decoder;
pub mod error;
mod marker;
pub mod packet;
pub mod stream;
pub mod varint;

pub use buffers::{Buffers, Cursor};
pub use codec::FrameCodec;
pub use decoder::{encode_frame, FrameConfig, FrameDecoder, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, INDICATOR};
pub use error::{FrameError, Result};
pub use packet::{encode_packet, StreamPacketDecoder, PACKET_MAGIC};
pub use stream::{framed_transport, StreamSink};
