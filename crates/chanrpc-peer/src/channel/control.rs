use bytes::{Bytes, BytesMut, BufMut};
use chanrpc_protocol::{BinaryReader, BinaryWriter, ProtocolError};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Leading byte of a JSON control message.
pub const FORMAT_JSON: u8 = 0;
/// Leading byte of a binary payload message.
pub const FORMAT_BINARY: u8 = 1;

/// Close code for a normal channel close.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for channels lost with their physical socket.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Error code sent when no route matches an `open` path.
pub const ERROR_NO_ROUTE: u16 = 404;

/// One message of the channel control protocol.
///
/// Everything except `Binary` travels as JSON tagged by `kind`. `Binary`
/// carries raw bytes after the channel id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
    Open {
        id: String,
        path: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    ServerReady {
        id: String,
    },
    Data {
        id: String,
        content: String,
    },
    #[serde(skip)]
    Binary {
        id: String,
        binary: Bytes,
    },
    Close {
        id: String,
        code: u16,
        reason: String,
    },
    Error {
        id: String,
        code: u16,
        message: String,
    },
}

impl ChannelMessage {
    /// Channel id the message addresses, if any.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            ChannelMessage::Ping { .. } | ChannelMessage::Pong { .. } => None,
            ChannelMessage::Open { id, .. }
            | ChannelMessage::ServerReady { id }
            | ChannelMessage::Data { id, .. }
            | ChannelMessage::Binary { id, .. }
            | ChannelMessage::Close { id, .. }
            | ChannelMessage::Error { id, .. } => Some(id),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        match self {
            ChannelMessage::Binary { id, binary } => {
                let mut writer = BinaryWriter::with_capacity(binary.len() + id.len() + 6);
                writer.u8(FORMAT_BINARY);
                writer.string(id)?;
                let head = writer.finish();
                let mut buf = BytesMut::with_capacity(head.len() + binary.len());
                buf.put_slice(&head);
                buf.put_slice(binary);
                Ok(buf.freeze())
            }
            other => {
                let json = serde_json::to_vec(other).map_err(ProtocolError::from)?;
                let mut buf = BytesMut::with_capacity(json.len() + 1);
                buf.put_u8(FORMAT_JSON);
                buf.put_slice(&json);
                Ok(buf.freeze())
            }
        }
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        match reader.u8()? {
            FORMAT_JSON => {
                let json = reader.rest();
                Ok(serde_json::from_slice(&json).map_err(ProtocolError::from)?)
            }
            FORMAT_BINARY => {
                let id = reader.string()?;
                Ok(ChannelMessage::Binary {
                    id,
                    binary: reader.rest(),
                })
            }
            other => Err(ProtocolError::UnknownTag(other).into()),
        }
    }
}
