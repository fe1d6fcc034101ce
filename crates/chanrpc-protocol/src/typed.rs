//! Fixed-shape codecs built from a [`ProtocolEntry`].
//!
//! Every declared slot starts with a presence byte (`0` undefined, `1` null,
//! `2` present) followed, when present, by the value in the slot's declared
//! representation. No type tags are written.

use serde::{Deserialize, Serialize};

use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::{ProtocolError, Result};
use crate::generic::GenericCodec;
use crate::value::Value;

const SLOT_UNDEFINED: u8 = 0;
const SLOT_NULL: u8 = 1;
const SLOT_PRESENT: u8 = 2;

/// Declared shape of one argument or result slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Self-describing; falls back to the generic encoding for this slot.
    Any,
    Bool,
    Int32,
    Int64,
    Double,
    String,
    Buffer,
    /// Any value, carried as a JSON string.
    Json,
    Array(Box<ValueType>),
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Any => "any",
            ValueType::Bool => "bool",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Buffer => "buffer",
            ValueType::Json => "json",
            ValueType::Array(_) => "array",
        }
    }
}

/// Argument and result shapes of one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub method: String,
    #[serde(default)]
    pub args: Vec<ValueType>,
    #[serde(default = "any_result")]
    pub result: ValueType,
}

fn any_result() -> ValueType {
    ValueType::Any
}

impl ProtocolEntry {
    pub fn new(method: impl Into<String>, args: Vec<ValueType>, result: ValueType) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }
}

/// Codec for one registered method.
#[derive(Debug, Clone)]
pub struct TypedCodec {
    entry: ProtocolEntry,
    generic: GenericCodec,
}

impl TypedCodec {
    pub fn new(entry: ProtocolEntry, generic: GenericCodec) -> Self {
        Self { entry, generic }
    }

    pub fn entry(&self) -> &ProtocolEntry {
        &self.entry
    }

    /// Write the declared argument tuple.
    ///
    /// Missing trailing arguments are sent as undefined; surplus arguments
    /// are an error.
    pub fn write_args(&self, args: &[Value], writer: &mut BinaryWriter) -> Result<()> {
        if args.len() > self.entry.args.len() {
            return Err(ProtocolError::ArityMismatch {
                method: self.entry.method.clone(),
                expected: self.entry.args.len(),
                found: args.len(),
            });
        }
        for (index, ty) in self.entry.args.iter().enumerate() {
            let arg = args.get(index).unwrap_or(&Value::Undefined);
            self.write_slot(ty, arg, writer)?;
        }
        Ok(())
    }

    /// Read the declared argument tuple, dropping trailing undefined slots.
    pub fn read_args(&self, reader: &mut BinaryReader) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(self.entry.args.len());
        for ty in &self.entry.args {
            args.push(self.read_slot(ty, reader)?);
        }
        while matches!(args.last(), Some(Value::Undefined)) {
            args.pop();
        }
        Ok(args)
    }

    pub fn write_result(&self, result: &Value, writer: &mut BinaryWriter) -> Result<()> {
        self.write_slot(&self.entry.result, result, writer)
    }

    pub fn read_result(&self, reader: &mut BinaryReader) -> Result<Value> {
        self.read_slot(&self.entry.result, reader)
    }

    fn write_slot(&self, ty: &ValueType, value: &Value, writer: &mut BinaryWriter) -> Result<()> {
        match value {
            Value::Undefined => writer.u8(SLOT_UNDEFINED),
            Value::Null => writer.u8(SLOT_NULL),
            value => {
                writer.u8(SLOT_PRESENT);
                self.write_present(ty, value, writer)?;
            }
        }
        Ok(())
    }

    fn write_present(&self, ty: &ValueType, value: &Value, writer: &mut BinaryWriter) -> Result<()> {
        match (ty, value) {
            (ValueType::Any, value) => self.generic.write_value(value, writer)?,
            (ValueType::Json, value) => writer.string(&serde_json::to_string(&value.to_json())?)?,
            (ValueType::Bool, Value::Bool(b)) => writer.bool(*b),
            (ValueType::Int32, Value::Int(i)) => writer.i32(*i),
            (ValueType::Int32, Value::Double(d)) => match Value::number(*d) {
                Value::Int(i) => writer.i32(i),
                other => return mismatch(ty, &other),
            },
            (ValueType::Int32, Value::BigInt(i)) => match i32::try_from(*i) {
                Ok(small) => writer.i32(small),
                Err(_) => return mismatch(ty, value),
            },
            (ValueType::Int64, Value::Int(i)) => writer.i64(i64::from(*i)),
            (ValueType::Int64, Value::BigInt(i)) => writer.i64(*i),
            (ValueType::Double, Value::Int(i)) => writer.f64(f64::from(*i)),
            (ValueType::Double, Value::Double(d)) => writer.f64(*d),
            (ValueType::String, Value::String(s)) => writer.string(s)?,
            (ValueType::Buffer, Value::Buffer(bytes)) => writer.bytes(bytes)?,
            (ValueType::Array(inner), Value::Array(items)) => {
                let len = u32::try_from(items.len())
                    .map_err(|_| ProtocolError::InvalidEntry(format!("{} elements", items.len())))?;
                writer.varuint(len);
                for item in items {
                    self.write_slot(inner, item, writer)?;
                }
            }
            (ty, value) => return mismatch(ty, value),
        }
        Ok(())
    }

    fn read_slot(&self, ty: &ValueType, reader: &mut BinaryReader) -> Result<Value> {
        match reader.u8()? {
            SLOT_UNDEFINED => Ok(Value::Undefined),
            SLOT_NULL => Ok(Value::Null),
            SLOT_PRESENT => self.read_present(ty, reader),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    fn read_present(&self, ty: &ValueType, reader: &mut BinaryReader) -> Result<Value> {
        let value = match ty {
            ValueType::Any => self.generic.read_value(reader)?,
            ValueType::Json => {
                let json: serde_json::Value = serde_json::from_str(&reader.string()?)?;
                Value::from_json(json)
            }
            ValueType::Bool => Value::Bool(reader.bool()?),
            ValueType::Int32 => Value::Int(reader.i32()?),
            ValueType::Int64 => Value::BigInt(reader.i64()?),
            ValueType::Double => Value::number(reader.f64()?),
            ValueType::String => Value::String(reader.string()?),
            ValueType::Buffer => Value::Buffer(reader.bytes()?),
            ValueType::Array(inner) => {
                let len = reader.varuint()? as usize;
                let mut items = Vec::with_capacity(len.min(reader.remaining()));
                for _ in 0..len {
                    items.push(self.read_slot(inner, reader)?);
                }
                Value::Array(items)
            }
        };
        Ok(value)
    }
}

fn mismatch(ty: &ValueType, value: &Value) -> Result<()> {
    Err(ProtocolError::TypeMismatch {
        expected: ty.name(),
        found: value.kind(),
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn codec(args: Vec<ValueType>, result: ValueType) -> TypedCodec {
        TypedCodec::new(ProtocolEntry::new("m", args, result), GenericCodec::default())
    }

    fn args_round_trip(codec: &TypedCodec, args: &[Value]) -> Vec<Value> {
        let mut writer = BinaryWriter::new();
        codec.write_args(args, &mut writer).unwrap();
        let mut reader = BinaryReader::new(writer.finish());
        let decoded = codec.read_args(&mut reader).unwrap();
        reader.expect_end().unwrap();
        decoded
    }

    #[test]
    fn int32_pair_is_compact() {
        let codec = codec(vec![ValueType::Int32, ValueType::Int32], ValueType::Int32);
        let mut writer = BinaryWriter::new();
        codec
            .write_args(&[Value::Int(1), Value::Int(2)], &mut writer)
            .unwrap();
        assert_eq!(writer.len(), 10);

        let mut reader = BinaryReader::new(writer.finish());
        assert_eq!(
            codec.read_args(&mut reader).unwrap(),
            vec![Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn mixed_slots_round_trip() {
        let codec = codec(
            vec![
                ValueType::String,
                ValueType::Buffer,
                ValueType::Int64,
                ValueType::Array(Box::new(ValueType::Double)),
                ValueType::Any,
                ValueType::Bool,
            ],
            ValueType::Any,
        );
        let args = vec![
            Value::String("path".into()),
            Value::Buffer(Bytes::from_static(b"abc")),
            Value::BigInt(-1 << 40),
            Value::Array(vec![Value::Double(0.5), Value::Null, Value::Int(2)]),
            Value::Array(vec![Value::Bool(false)]),
            Value::Bool(true),
        ];
        assert_eq!(args_round_trip(&codec, &args), args);
    }

    #[test]
    fn missing_trailing_args_are_undefined() {
        let codec = codec(vec![ValueType::Int32, ValueType::String], ValueType::Any);
        assert_eq!(args_round_trip(&codec, &[Value::Int(7)]), vec![Value::Int(7)]);
        assert_eq!(
            args_round_trip(&codec, &[Value::Undefined, Value::String("x".into())]),
            vec![Value::Undefined, Value::String("x".into())]
        );
    }

    #[test]
    fn surplus_args_are_rejected() {
        let codec = codec(vec![ValueType::Int32], ValueType::Any);
        let mut writer = BinaryWriter::new();
        let err = codec
            .write_args(&[Value::Int(1), Value::Int(2)], &mut writer)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ArityMismatch { expected: 1, found: 2, .. }
        ));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let codec = codec(vec![ValueType::Int32], ValueType::Any);
        let mut writer = BinaryWriter::new();
        let err = codec
            .write_args(&[Value::String("1".into())], &mut writer)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TypeMismatch { expected: "int32", found: "string" }
        ));

        let err = codec.write_args(&[Value::Double(1.5)], &mut writer).unwrap_err();
        assert!(matches!(err, ProtocolError::TypeMismatch { .. }));
    }

    #[test]
    fn json_slot_carries_objects() {
        let codec = codec(vec![], ValueType::Json);
        let result = Value::Json(json!({ "ok": true, "items": [1, 2] }));
        let mut writer = BinaryWriter::new();
        codec.write_result(&result, &mut writer).unwrap();
        let mut reader = BinaryReader::new(writer.finish());
        assert_eq!(codec.read_result(&mut reader).unwrap(), result);
    }

    #[test]
    fn entries_deserialize_from_json() {
        let entry: ProtocolEntry = serde_json::from_value(json!({
            "method": "fs/read",
            "args": ["string", { "array": "int32" }],
            "result": "buffer"
        }))
        .unwrap();
        assert_eq!(
            entry.args,
            vec![ValueType::String, ValueType::Array(Box::new(ValueType::Int32))]
        );
        assert_eq!(entry.result, ValueType::Buffer);

        let bare: ProtocolEntry = serde_json::from_value(json!({ "method": "ping" })).unwrap();
        assert!(bare.args.is_empty());
        assert_eq!(bare.result, ValueType::Any);
    }
}
