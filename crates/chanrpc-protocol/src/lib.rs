//! Binary RPC envelopes and payload codecs.
//!
//! A [`WireMessage`] is encoded into one frame payload. Its arguments or
//! result are written by the codec the [`ProtocolRepository`] picks for the
//! method: a [`TypedCodec`] when a [`ProtocolEntry`] is registered, the shared
//! self-describing [`GenericCodec`] otherwise.

pub mod binary;
pub mod config;
pub mod error;
pub mod generic;
pub mod message;
pub mod remote;
pub mod repository;
pub mod typed;
pub mod value;

pub use binary::{BinaryReader, BinaryWriter};
pub use config::ProtocolConfig;
pub use error::{ProtocolError, Result};
pub use generic::GenericCodec;
pub use message::{OperationKind, RequestHeaders, ResponseHeaders, WireMessage, PROTOCOL_VERSION};
pub use remote::{RemoteError, METHOD_NOT_REGISTERED};
pub use repository::{MethodCodec, ProtocolRepository};
pub use typed::{ProtocolEntry, TypedCodec, ValueType};
pub use value::{FromValue, Value, BUFFER_MARKER, URI_MARKER};
