use bytes::Bytes;
use serde_json::{json, Map, Number};

use crate::error::{ProtocolError, Result};

/// JSON marker type for URI values carried through the JSON escape hatch.
pub const URI_MARKER: &str = "VSCODE_URI";
/// JSON marker type for byte buffers carried through the JSON escape hatch.
pub const BUFFER_MARKER: &str = "Buffer";

/// A dynamically typed argument or result.
///
/// Numbers keep the distinction the wire keeps: `Int` for whole numbers that
/// fit 32 bits, `Double` otherwise, `BigInt` for explicit 64-bit integers.
///
/// Equality compares `Int` and `Double` by numeric value, so `Int(42)`
/// equals `Double(42.0)`, and `NaN` equals `NaN`. `BigInt` only equals
/// `BigInt`.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Double(f64),
    BigInt(i64),
    String(String),
    Buffer(Bytes),
    Array(Vec<Value>),
    /// A resource identifier, sent as a marked JSON object.
    Uri(String),
    /// Anything else, carried as JSON.
    Json(serde_json::Value),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(i), Value::Double(d)) | (Value::Double(d), Value::Int(i)) => {
                f64::from(*i) == *d
            }
            (Value::Double(a), Value::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) | (Value::Uri(a), Value::Uri(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// A number, using `Int` when it is whole and fits in 32 bits.
    pub fn number(value: f64) -> Self {
        if value.fract() == 0.0
            && value >= f64::from(i32::MIN)
            && value <= f64::from(i32::MAX)
            && !(value == 0.0 && value.is_sign_negative())
        {
            Value::Int(value as i32)
        } else {
            Value::Double(value)
        }
    }

    /// A byte buffer.
    pub fn buffer(bytes: impl Into<Bytes>) -> Self {
        Value::Buffer(bytes.into())
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int32",
            Value::Double(_) => "double",
            Value::BigInt(_) => "int64",
            Value::String(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Array(_) => "array",
            Value::Uri(_) => "uri",
            Value::Json(_) => "json",
        }
    }

    /// `Undefined` or `Null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Convert from plain JSON.
    ///
    /// Scalars and arrays map to their native variants; objects carrying the
    /// URI or buffer marker are revived; other objects stay `Json`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => number_from_json(&n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => revive_object(map),
        }
    }

    /// Convert to plain JSON, marking URIs and buffers so
    /// [`Value::from_json`] can revive them.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Double(d) => Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::BigInt(i) => json!(i),
            Value::String(s) => json!(s),
            Value::Buffer(bytes) => json!({ "$type": BUFFER_MARKER, "data": bytes.to_vec() }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Uri(uri) => json!({ "$type": URI_MARKER, "data": uri }),
            Value::Json(json) => json.clone(),
        }
    }
}

fn number_from_json(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        match i32::try_from(i) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::Double(i as f64),
        }
    } else {
        Value::number(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn revive_object(map: Map<String, serde_json::Value>) -> Value {
    let marker = map.get("$type").and_then(serde_json::Value::as_str);
    let revived = match (marker, map.get("data")) {
        (Some(URI_MARKER), Some(serde_json::Value::String(uri))) => Some(Value::Uri(uri.clone())),
        (Some(BUFFER_MARKER), Some(serde_json::Value::Array(items))) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .map(|bytes| Value::Buffer(Bytes::from(bytes))),
        _ => None,
    };
    revived.unwrap_or_else(|| Value::Json(serde_json::Value::Object(map)))
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::BigInt(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        match i32::try_from(value) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::BigInt(i64::from(value)),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::number(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Buffer(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::from_json(value)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Undefined
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Conversion out of a received [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T> {
    Err(ProtocolError::TypeMismatch {
        expected,
        found: found.kind(),
    })
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => mismatch("bool", &other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(i),
            Value::BigInt(i) => i32::try_from(i).or_else(|_| mismatch("int32", &value)),
            other => mismatch("int32", &other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(i64::from(i)),
            Value::BigInt(i) => Ok(i),
            other => mismatch("int64", &other),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(f64::from(i)),
            Value::Double(d) => Ok(d),
            Value::BigInt(i) => Ok(i as f64),
            other => mismatch("double", &other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) | Value::Uri(s) => Ok(s),
            other => mismatch("string", &other),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Buffer(bytes) => Ok(bytes),
            other => mismatch("buffer", &other),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value.to_json())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        if value.is_nullish() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("array", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_numbers_take_the_int_fast_path() {
        assert!(matches!(Value::number(3.0), Value::Int(3)));
        assert!(matches!(Value::number(-7.0), Value::Int(-7)));
        assert!(matches!(Value::number(2.5), Value::Double(d) if d == 2.5));
        assert!(matches!(Value::number(4_294_967_296.0), Value::Double(_)));
        assert!(matches!(Value::number(-0.0), Value::Double(_)));
    }

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(Value::Int(42), Value::Double(42.0));
        assert_eq!(Value::Double(-3.0), Value::Int(-3));
        assert_ne!(Value::Int(42), Value::Double(42.5));
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::BigInt(42), Value::Int(42));
        assert_eq!(
            Value::Array(vec![Value::Double(1.0)]),
            Value::Array(vec![Value::Int(1)])
        );
    }

    #[test]
    fn json_markers_are_revived() {
        let uri = Value::from_json(json!({ "$type": "VSCODE_URI", "data": "file:///tmp/a" }));
        assert_eq!(uri, Value::Uri("file:///tmp/a".to_string()));

        let buffer = Value::from_json(json!({ "$type": "Buffer", "data": [1, 2, 255] }));
        assert_eq!(buffer, Value::buffer(vec![1u8, 2, 255]));

        let plain = Value::from_json(json!({ "$type": "Other", "data": 1 }));
        assert!(matches!(plain, Value::Json(_)));
    }

    #[test]
    fn to_json_marks_uris_and_buffers() {
        let value = Value::Array(vec![
            Value::Uri("file:///x".into()),
            Value::buffer(vec![9u8]),
            Value::Undefined,
        ]);
        assert_eq!(
            value.to_json(),
            json!([{ "$type": "VSCODE_URI", "data": "file:///x" }, { "$type": "Buffer", "data": [9] }, null])
        );
    }

    #[test]
    fn from_value_conversions() {
        assert_eq!(i64::from_value(Value::Int(5)).unwrap(), 5);
        assert_eq!(f64::from_value(Value::Int(5)).unwrap(), 5.0);
        assert_eq!(Option::<i32>::from_value(Value::Null).unwrap(), None);
        assert_eq!(
            Vec::<String>::from_value(Value::Array(vec!["a".into(), "b".into()])).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(matches!(
            bool::from_value(Value::Int(1)),
            Err(ProtocolError::TypeMismatch { expected: "bool", found: "int32" })
        ));
    }
}
