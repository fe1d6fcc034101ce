//! RPC envelope encoding.
//!
//! ```text
//! [version:u8][kind:u8][id:u32 le][method:varstring][headers:u8][payload]
//! ```
//!
//! `Cancel` carries only the version, kind and id. The payload is the
//! argument list for requests and notifications, the result for responses and
//! the stringified error for errors. Chunked responses always encode their
//! result with the generic codec, whatever the method's entry says.

use bytes::Bytes;

use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::{ProtocolError, Result};
use crate::remote::RemoteError;
use crate::repository::{MethodCodec, ProtocolRepository};
use crate::value::Value;

/// Envelope version written by this build.
pub const PROTOCOL_VERSION: u8 = 1;

const CANCELABLE: u8 = 0b0000_0001;
const CHUNKED: u8 = 0b0000_0001;

/// Operation carried by a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationKind {
    Request = 1,
    Notification = 2,
    Response = 3,
    Cancel = 4,
    Error = 5,
}

impl TryFrom<u8> for OperationKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OperationKind::Request),
            2 => Ok(OperationKind::Notification),
            3 => Ok(OperationKind::Response),
            4 => Ok(OperationKind::Cancel),
            5 => Ok(OperationKind::Error),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

/// Headers of requests and notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    /// The sender may cancel this request; the handler receives a token.
    pub cancelable: bool,
}

impl RequestHeaders {
    fn to_byte(self) -> u8 {
        if self.cancelable {
            CANCELABLE
        } else {
            0
        }
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            cancelable: byte & CANCELABLE != 0,
        }
    }
}

/// Headers of responses and errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    /// This frame is one chunk of a streamed response.
    pub chunked: bool,
}

impl ResponseHeaders {
    fn to_byte(self) -> u8 {
        if self.chunked {
            CHUNKED
        } else {
            0
        }
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            chunked: byte & CHUNKED != 0,
        }
    }
}

/// One decoded RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request {
        id: u32,
        method: String,
        headers: RequestHeaders,
        args: Vec<Value>,
    },
    Notification {
        id: u32,
        method: String,
        headers: RequestHeaders,
        args: Vec<Value>,
    },
    Response {
        id: u32,
        method: String,
        headers: ResponseHeaders,
        result: Value,
    },
    Error {
        id: u32,
        method: String,
        headers: ResponseHeaders,
        error: RemoteError,
    },
    Cancel {
        id: u32,
    },
}

impl WireMessage {
    pub fn id(&self) -> u32 {
        match self {
            WireMessage::Request { id, .. }
            | WireMessage::Notification { id, .. }
            | WireMessage::Response { id, .. }
            | WireMessage::Error { id, .. }
            | WireMessage::Cancel { id } => *id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            WireMessage::Request { .. } => OperationKind::Request,
            WireMessage::Notification { .. } => OperationKind::Notification,
            WireMessage::Response { .. } => OperationKind::Response,
            WireMessage::Error { .. } => OperationKind::Error,
            WireMessage::Cancel { .. } => OperationKind::Cancel,
        }
    }

    /// Method name, absent for `Cancel`.
    pub fn method(&self) -> Option<&str> {
        match self {
            WireMessage::Request { method, .. }
            | WireMessage::Notification { method, .. }
            | WireMessage::Response { method, .. }
            | WireMessage::Error { method, .. } => Some(method),
            WireMessage::Cancel { .. } => None,
        }
    }

    /// Encode using the codec `repository` selects for the method.
    pub fn encode(&self, repository: &ProtocolRepository) -> Result<Bytes> {
        let mut writer = BinaryWriter::with_capacity(32);
        writer.u8(PROTOCOL_VERSION);
        writer.u8(self.kind() as u8);
        writer.u32(self.id());

        match self {
            WireMessage::Request {
                method,
                headers,
                args,
                ..
            }
            | WireMessage::Notification {
                method,
                headers,
                args,
                ..
            } => {
                writer.string(method)?;
                writer.u8(headers.to_byte());
                repository.codec_for(method).write_args(args, &mut writer)?;
            }
            WireMessage::Response {
                method,
                headers,
                result,
                ..
            } => {
                writer.string(method)?;
                writer.u8(headers.to_byte());
                result_codec(repository, method, *headers).write_result(result, &mut writer)?;
            }
            WireMessage::Error {
                method,
                headers,
                error,
                ..
            } => {
                writer.string(method)?;
                writer.u8(headers.to_byte());
                writer.string(&error.stringify())?;
            }
            WireMessage::Cancel { .. } => {}
        }

        Ok(writer.finish())
    }

    /// Decode one envelope.
    pub fn decode(data: Bytes, repository: &ProtocolRepository) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let kind = OperationKind::try_from(reader.u8()?)?;
        let id = reader.u32()?;

        let message = match kind {
            OperationKind::Cancel => WireMessage::Cancel { id },
            OperationKind::Request | OperationKind::Notification => {
                let method = reader.string()?;
                let headers = RequestHeaders::from_byte(reader.u8()?);
                let args = repository.codec_for(&method).read_args(&mut reader)?;
                if kind == OperationKind::Request {
                    WireMessage::Request {
                        id,
                        method,
                        headers,
                        args,
                    }
                } else {
                    WireMessage::Notification {
                        id,
                        method,
                        headers,
                        args,
                    }
                }
            }
            OperationKind::Response => {
                let method = reader.string()?;
                let headers = ResponseHeaders::from_byte(reader.u8()?);
                let result = result_codec(repository, &method, headers).read_result(&mut reader)?;
                WireMessage::Response {
                    id,
                    method,
                    headers,
                    result,
                }
            }
            OperationKind::Error => {
                let method = reader.string()?;
                let headers = ResponseHeaders::from_byte(reader.u8()?);
                let error = RemoteError::parse(&reader.string()?);
                WireMessage::Error {
                    id,
                    method,
                    headers,
                    error,
                }
            }
        };

        if repository.config().reject_trailing_bytes {
            reader.expect_end()?;
        }
        Ok(message)
    }
}

fn result_codec<'a>(
    repository: &'a ProtocolRepository,
    method: &str,
    headers: ResponseHeaders,
) -> MethodCodec<'a> {
    if headers.chunked {
        MethodCodec::Generic(repository.generic())
    } else {
        repository.codec_for(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::{ProtocolEntry, ValueType};

    fn repository() -> ProtocolRepository {
        let mut repository = ProtocolRepository::new();
        repository
            .register(ProtocolEntry::new(
                "add",
                vec![ValueType::Int32, ValueType::Int32],
                ValueType::Int32,
            ))
            .unwrap();
        repository
    }

    #[test]
    fn envelope_layout() {
        let message = WireMessage::Request {
            id: 0x0102_0304,
            method: "add".into(),
            headers: RequestHeaders { cancelable: true },
            args: vec![Value::Int(1), Value::Int(2)],
        };
        let bytes = message.encode(&repository()).unwrap();
        assert_eq!(&bytes[..6], &[PROTOCOL_VERSION, 1, 4, 3, 2, 1]);
        assert_eq!(&bytes[6..10], &[3, b'a', b'd', b'd']);
        assert_eq!(bytes[10], CANCELABLE);
        assert_eq!(bytes.len(), 11 + 10);
    }

    #[test]
    fn cancel_is_six_bytes() {
        let bytes = WireMessage::Cancel { id: 9 }.encode(&repository()).unwrap();
        assert_eq!(bytes.as_ref(), &[PROTOCOL_VERSION, 4, 9, 0, 0, 0]);
    }

    #[test]
    fn chunked_responses_use_generic_encoding() {
        let repository = repository();
        let chunk = WireMessage::Response {
            id: 1,
            method: "add".into(),
            headers: ResponseHeaders { chunked: true },
            result: Value::buffer(vec![1u8, 2, 3]),
        };
        let decoded = WireMessage::decode(chunk.encode(&repository).unwrap(), &repository).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn rejects_unknown_version_and_kind() {
        let repository = repository();
        assert!(matches!(
            WireMessage::decode(Bytes::from_static(&[2, 1, 0, 0, 0, 0]), &repository),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            WireMessage::decode(Bytes::from_static(&[1, 9, 0, 0, 0, 0]), &repository),
            Err(ProtocolError::UnknownOperation(9))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected_by_default() {
        let repository = repository();
        assert!(matches!(
            WireMessage::decode(Bytes::from_static(&[1, 4, 0, 0, 0, 0, 0xff]), &repository),
            Err(ProtocolError::TrailingBytes(1))
        ));

        let lenient = ProtocolRepository::with_config(
            crate::ProtocolConfig::default().with_reject_trailing_bytes(false),
        );
        assert_eq!(
            WireMessage::decode(Bytes::from_static(&[1, 4, 0, 0, 0, 0, 0xff]), &lenient).unwrap(),
            WireMessage::Cancel { id: 0 }
        );
    }

    #[test]
    fn truncated_message_is_an_error() {
        let repository = repository();
        assert!(matches!(
            WireMessage::decode(Bytes::from_static(&[1, 1, 0, 0]), &repository),
            Err(ProtocolError::UnexpectedEof { .. })
        ));
    }
}
