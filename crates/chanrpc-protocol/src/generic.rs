//! Self-describing tagged encoding for values with no registered shape.
//!
//! Every value starts with a one-byte tag. Arrays carry a varint element
//! count followed by their elements; objects, URIs and other JSON values are
//! sent as a JSON string and revived on the way in.

use crate::binary::{BinaryReader, BinaryWriter};
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::value::Value;

pub const TAG_UNDEFINED: u8 = 0;
pub const TAG_NULL: u8 = 1;
pub const TAG_FALSE: u8 = 2;
pub const TAG_TRUE: u8 = 3;
pub const TAG_INT32: u8 = 4;
pub const TAG_DOUBLE: u8 = 5;
pub const TAG_STRING: u8 = 6;
pub const TAG_BUFFER: u8 = 7;
pub const TAG_BIGINT: u8 = 8;
pub const TAG_ARRAY: u8 = 9;
pub const TAG_JSON: u8 = 10;

/// The shared fallback codec.
#[derive(Debug, Clone, Copy)]
pub struct GenericCodec {
    max_depth: usize,
}

impl GenericCodec {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            max_depth: config.max_nesting_depth,
        }
    }

    /// Write an argument list as one array.
    pub fn write_args(&self, args: &[Value], writer: &mut BinaryWriter) -> Result<()> {
        writer.varuint(count(args.len())?);
        for arg in args {
            self.write_value(arg, writer)?;
        }
        Ok(())
    }

    pub fn read_args(&self, reader: &mut BinaryReader) -> Result<Vec<Value>> {
        let len = reader.varuint()? as usize;
        let mut args = Vec::with_capacity(len.min(reader.remaining()));
        for _ in 0..len {
            args.push(self.read_value(reader)?);
        }
        Ok(args)
    }

    pub fn write_value(&self, value: &Value, writer: &mut BinaryWriter) -> Result<()> {
        self.write_nested(value, writer, 0)
    }

    pub fn read_value(&self, reader: &mut BinaryReader) -> Result<Value> {
        self.read_nested(reader, 0)
    }

    fn write_nested(&self, value: &Value, writer: &mut BinaryWriter, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(ProtocolError::NestingTooDeep(self.max_depth));
        }
        match value {
            Value::Undefined => writer.u8(TAG_UNDEFINED),
            Value::Null => writer.u8(TAG_NULL),
            Value::Bool(false) => writer.u8(TAG_FALSE),
            Value::Bool(true) => writer.u8(TAG_TRUE),
            Value::Int(i) => {
                writer.u8(TAG_INT32);
                writer.i32(*i);
            }
            Value::Double(d) => match Value::number(*d) {
                Value::Int(i) => {
                    writer.u8(TAG_INT32);
                    writer.i32(i);
                }
                _ => {
                    writer.u8(TAG_DOUBLE);
                    writer.f64(*d);
                }
            },
            Value::BigInt(i) => {
                writer.u8(TAG_BIGINT);
                writer.i64(*i);
            }
            Value::String(s) => {
                writer.u8(TAG_STRING);
                writer.string(s)?;
            }
            Value::Buffer(bytes) => {
                writer.u8(TAG_BUFFER);
                writer.bytes(bytes)?;
            }
            Value::Array(items) => {
                writer.u8(TAG_ARRAY);
                writer.varuint(count(items.len())?);
                for item in items {
                    self.write_nested(item, writer, depth + 1)?;
                }
            }
            Value::Uri(_) | Value::Json(_) => {
                writer.u8(TAG_JSON);
                writer.string(&serde_json::to_string(&value.to_json())?)?;
            }
        }
        Ok(())
    }

    fn read_nested(&self, reader: &mut BinaryReader, depth: usize) -> Result<Value> {
        if depth > self.max_depth {
            return Err(ProtocolError::NestingTooDeep(self.max_depth));
        }
        let value = match reader.u8()? {
            TAG_UNDEFINED => Value::Undefined,
            TAG_NULL => Value::Null,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT32 => Value::Int(reader.i32()?),
            TAG_DOUBLE => Value::Double(reader.f64()?),
            TAG_STRING => Value::String(reader.string()?),
            TAG_BUFFER => Value::Buffer(reader.bytes()?),
            TAG_BIGINT => Value::BigInt(reader.i64()?),
            TAG_ARRAY => {
                let len = reader.varuint()? as usize;
                let mut items = Vec::with_capacity(len.min(reader.remaining()));
                for _ in 0..len {
                    items.push(self.read_nested(reader, depth + 1)?);
                }
                Value::Array(items)
            }
            TAG_JSON => {
                let json: serde_json::Value = serde_json::from_str(&reader.string()?)?;
                if json.is_object() {
                    Value::from_json(json)
                } else {
                    Value::Json(json)
                }
            }
            tag => return Err(ProtocolError::UnknownTag(tag)),
        };
        Ok(value)
    }
}

impl Default for GenericCodec {
    fn default() -> Self {
        Self::new(&ProtocolConfig::default())
    }
}

fn count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::InvalidEntry(format!("{len} elements")))
}
