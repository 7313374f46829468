//! Conversion between native Rust values and stored payloads
//!
//! Values are stored as text: numbers in their decimal representation,
//! booleans as `1`/`0` (with `true`/`false` accepted on read), strings
//! verbatim. This covers the scalar types the typed session helpers need;
//! the full marshalling layer for arrays and structures lives outside this
//! crate.

use crate::error::{Result, SmaxError};
use crate::types::{Payload, PulledValue, TypeTag};

/// Types that can be built from a pulled value
pub trait Decode: Sized {
    /// Convert the stored bytes into `Self`
    fn decode(value: &PulledValue) -> Result<Self>;
}

/// Types that can be turned into a share payload
pub trait Encode {
    /// Serialize `self` into a payload with the matching type tag
    fn encode(&self) -> Payload;
}

fn text(value: &PulledValue) -> Result<&str> {
    value.as_text().map(str::trim)
}

fn decode_error(value: &PulledValue, wanted: &str) -> SmaxError {
    SmaxError::Decode(format!(
        "{} ({}) cannot be read as {}: '{}'",
        value.var,
        value.meta.type_tag,
        wanted,
        String::from_utf8_lossy(&value.bytes)
    ))
}

impl Decode for f64 {
    fn decode(value: &PulledValue) -> Result<Self> {
        let s = text(value)?;
        // Store uses "nan"/"inf" spellings alongside Rust's own
        match s.to_ascii_lowercase().as_str() {
            "nan" => return Ok(f64::NAN),
            "inf" | "+inf" | "infinity" => return Ok(f64::INFINITY),
            "-inf" | "-infinity" => return Ok(f64::NEG_INFINITY),
            _ => {}
        }
        s.parse::<f64>().map_err(|_| decode_error(value, "f64"))
    }
}

impl Decode for f32 {
    fn decode(value: &PulledValue) -> Result<Self> {
        f64::decode(value).map(|v| v as f32)
    }
}

impl Decode for i64 {
    fn decode(value: &PulledValue) -> Result<Self> {
        let s = text(value)?;
        if let Ok(v) = s.parse::<i64>() {
            return Ok(v);
        }
        // Integer-valued floats are accepted, e.g. "3.0"
        match s.parse::<f64>() {
            Ok(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(f as i64)
            }
            _ => Err(decode_error(value, "i64")),
        }
    }
}

impl Decode for i32 {
    fn decode(value: &PulledValue) -> Result<Self> {
        let v = i64::decode(value)?;
        i32::try_from(v).map_err(|_| decode_error(value, "i32"))
    }
}

impl Decode for bool {
    fn decode(value: &PulledValue) -> Result<Self> {
        let s = text(value)?;
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "on" => Ok(true),
            "0" | "false" | "f" | "no" | "off" => Ok(false),
            _ => match s.parse::<f64>() {
                Ok(f) => Ok(f != 0.0),
                Err(_) => Err(decode_error(value, "bool")),
            },
        }
    }
}

impl Decode for String {
    fn decode(value: &PulledValue) -> Result<Self> {
        value.as_text().map(str::to_string)
    }
}

impl Decode for Vec<u8> {
    fn decode(value: &PulledValue) -> Result<Self> {
        Ok(value.bytes.clone())
    }
}

impl Encode for f64 {
    fn encode(&self) -> Payload {
        Payload::scalar(self.to_string(), TypeTag::Float64)
    }
}

impl Encode for f32 {
    fn encode(&self) -> Payload {
        Payload::scalar(self.to_string(), TypeTag::Float32)
    }
}

impl Encode for i64 {
    fn encode(&self) -> Payload {
        Payload::scalar(self.to_string(), TypeTag::Int64)
    }
}

impl Encode for i32 {
    fn encode(&self) -> Payload {
        Payload::scalar(self.to_string(), TypeTag::Int32)
    }
}

impl Encode for bool {
    fn encode(&self) -> Payload {
        Payload::scalar(if *self { "1" } else { "0" }, TypeTag::Boolean)
    }
}

impl Encode for str {
    fn encode(&self) -> Payload {
        Payload::scalar(self.as_bytes().to_vec(), TypeTag::String)
    }
}

impl Encode for String {
    fn encode(&self) -> Payload {
        self.as_str().encode()
    }
}

impl Encode for [u8] {
    fn encode(&self) -> Payload {
        Payload::scalar(self.to_vec(), TypeTag::Raw)
    }
}

impl Encode for Vec<u8> {
    fn encode(&self) -> Payload {
        self.as_slice().encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, VarRef};

    fn pulled(text: &str, tag: TypeTag) -> PulledValue {
        PulledValue {
            var: VarRef::new("test", "value").unwrap(),
            bytes: text.as_bytes().to_vec(),
            meta: Metadata {
                type_tag: tag,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_decode_numbers() {
        assert_eq!(f64::decode(&pulled("21.5", TypeTag::Float64)).unwrap(), 21.5);
        assert_eq!(i64::decode(&pulled(" -7 ", TypeTag::Int32)).unwrap(), -7);
        assert_eq!(i64::decode(&pulled("3.0", TypeTag::Float64)).unwrap(), 3);
        assert!(i64::decode(&pulled("3.5", TypeTag::Float64)).is_err());
        assert!(f64::decode(&pulled("NaN", TypeTag::Float64)).unwrap().is_nan());
        assert!(i32::decode(&pulled("99999999999", TypeTag::Int64)).is_err());
    }

    #[test]
    fn test_decode_bool() {
        assert!(bool::decode(&pulled("1", TypeTag::Boolean)).unwrap());
        assert!(bool::decode(&pulled("true", TypeTag::Boolean)).unwrap());
        assert!(!bool::decode(&pulled("0", TypeTag::Boolean)).unwrap());
        assert!(bool::decode(&pulled("maybe", TypeTag::Boolean)).is_err());
    }

    #[test]
    fn test_decode_error_kind() {
        let err = f64::decode(&pulled("warm", TypeTag::String)).unwrap_err();
        assert!(matches!(err, SmaxError::Decode(_)));
    }

    #[test]
    fn test_encode_tags() {
        assert_eq!(21.5f64.encode().type_tag, TypeTag::Float64);
        assert_eq!(true.encode().bytes, b"1".to_vec());
        assert_eq!("hello".encode().type_tag, TypeTag::String);
        assert_eq!(42i32.encode().bytes, b"42".to_vec());
    }
}
