//! Value conversion at the call boundary.
//!
//! Structured values go through serde (`rmpv::ext`). Primitive parameters and
//! returns are additionally coerced to the exact scalar kind their type code
//! promises, so a peer cannot smuggle a string into an `i32` slot.

use remora_wire::{TypeTag, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::RpcError;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value, RpcError> {
    Ok(rmpv::ext::to_value(value)?)
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    Ok(rmpv::ext::from_value(value)?)
}

/// Binary payloads travel as msgpack `bin`, which serde's `Vec<u8>` does not
/// accept directly.
pub fn decode_bytes(value: Value) -> Result<Vec<u8>, RpcError> {
    match value {
        Value::Binary(bytes) => Ok(bytes),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| RpcError::codec("byte array holds a non-byte element"))
            })
            .collect(),
        other => Err(RpcError::codec(format!("expected bytes, got {}", kind_of(&other)))),
    }
}

/// Coerces `value` to the scalar kind of `tag`. Non-primitive tags pass
/// through untouched except `bytes`, which must be binary.
pub fn coerce(tag: &TypeTag, value: Value) -> Result<Value, RpcError> {
    let mismatch = |value: &Value| {
        RpcError::codec(format!("expected {}, got {}", describe(tag), kind_of(value)))
    };
    match tag {
        TypeTag::Bool => match value {
            Value::Boolean(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        TypeTag::Char => match value.as_str().map(|s| s.chars().count()) {
            Some(1) => Ok(value),
            _ => Err(mismatch(&value)),
        },
        TypeTag::I8 => int_in(value, i8::MIN.into(), i8::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::I16 => int_in(value, i16::MIN.into(), i16::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::I32 => int_in(value, i32::MIN.into(), i32::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::I64 => int_in(value, i64::MIN.into(), i64::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::U8 => int_in(value, 0, u8::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::U16 => int_in(value, 0, u16::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::U32 => int_in(value, 0, u32::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::U64 => int_in(value, 0, u64::MAX.into()).map_err(|v| mismatch(&v)),
        TypeTag::F32 | TypeTag::F64 => match value {
            Value::F32(v) if matches!(tag, TypeTag::F64) => Ok(Value::F64(v.into())),
            Value::F64(v) if matches!(tag, TypeTag::F32) => Ok(Value::F32(v as f32)),
            Value::F32(_) | Value::F64(_) => Ok(value),
            Value::Integer(int) => {
                let v = int.as_f64().ok_or_else(|| mismatch(&value))?;
                Ok(if matches!(tag, TypeTag::F32) { Value::F32(v as f32) } else { Value::F64(v) })
            }
            other => Err(mismatch(&other)),
        },
        TypeTag::String => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        TypeTag::Bytes => match value {
            Value::Binary(_) => Ok(value),
            other => decode_bytes(other).map(Value::Binary),
        },
        TypeTag::Void | TypeTag::Stream | TypeTag::Named(_) | TypeTag::Contract(_) => Ok(value),
    }
}

fn int_in(value: Value, min: i128, max: i128) -> Result<Value, Value> {
    let in_range = match &value {
        Value::Integer(int) => {
            let wide = int.as_i64().map(i128::from).or_else(|| int.as_u64().map(i128::from));
            wide.is_some_and(|v| (min..=max).contains(&v))
        }
        _ => false,
    };
    if in_range {
        Ok(value)
    } else {
        Err(value)
    }
}

fn describe(tag: &TypeTag) -> String {
    match tag {
        TypeTag::Bool => "bool".into(),
        TypeTag::Char => "char".into(),
        TypeTag::I8 => "i8".into(),
        TypeTag::U8 => "u8".into(),
        TypeTag::I16 => "i16".into(),
        TypeTag::U16 => "u16".into(),
        TypeTag::I32 => "i32".into(),
        TypeTag::U32 => "u32".into(),
        TypeTag::I64 => "i64".into(),
        TypeTag::U64 => "u64".into(),
        TypeTag::F32 => "f32".into(),
        TypeTag::F64 => "f64".into(),
        TypeTag::String => "string".into(),
        other => other.to_string(),
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "bool",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "bytes",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "ext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        label: String,
    }

    #[test]
    fn structured_values_round_trip_through_serde() {
        let point = Point { x: -4, label: "origin".into() };
        let value = encode(&point).expect("encode");
        assert_eq!(decode::<Point>(value).expect("decode"), point);
    }

    #[test]
    fn integers_are_range_checked_per_type_code() {
        assert!(coerce(&TypeTag::I32, Value::from(25)).is_ok());
        assert!(coerce(&TypeTag::U8, Value::from(300)).is_err());
        assert!(coerce(&TypeTag::U64, Value::from(-1)).is_err());
        assert!(coerce(&TypeTag::I64, Value::from(u64::MAX)).is_err());
        assert!(coerce(&TypeTag::I32, Value::from("25")).is_err());
    }

    #[test]
    fn floats_accept_integers_and_widen() {
        assert_eq!(coerce(&TypeTag::F64, Value::from(2)).expect("int"), Value::F64(2.0));
        assert_eq!(coerce(&TypeTag::F64, Value::F32(0.5)).expect("f32"), Value::F64(0.5));
    }

    #[test]
    fn char_requires_exactly_one_character() {
        assert!(coerce(&TypeTag::Char, Value::from("é")).is_ok());
        assert!(coerce(&TypeTag::Char, Value::from("ab")).is_err());
    }

    #[test]
    fn bytes_accept_binary_or_byte_arrays() {
        let from_array = coerce(&TypeTag::Bytes, encode(&vec![1u8, 2, 3]).expect("encode"));
        assert_eq!(from_array.expect("array"), Value::Binary(vec![1, 2, 3]));
        assert!(coerce(&TypeTag::Bytes, Value::from("nope")).is_err());
    }
}
