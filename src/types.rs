//! Core data types for the SMA-X client
//!
//! This module contains the fundamental data structures used throughout
//! the crate for naming shared variables and describing the values pulled
//! from the store.
//!
//! # Main Types
//!
//! - [`VarRef`] - Table/key pair naming one shared variable
//! - [`TypeTag`] - Stored element type of a variable (int32, double, string, ...)
//! - [`Metadata`] - Type, dimensions, timestamp, origin and serial of a stored value
//! - [`PulledValue`] - Raw stored bytes together with their metadata
//! - [`Payload`] - What a share sends: bytes, type tag and dimensions
//! - [`UpdateEvent`] - An update notification received for a variable
//!
//! # Naming
//!
//! Variables live in hash tables whose names may themselves be nested groups
//! separated by [`SEPARATOR`]. The fully qualified id of a variable is
//! `table:key`; when parsing an id the *last* separator splits the table from
//! the key, so `system:subsystem:var` names variable `var` in table
//! `system:subsystem`.

use crate::error::{Result, SmaxError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between nested group names and between table and key
pub const SEPARATOR: &str = ":";

/// Maximum number of dimensions a stored value may have
pub const MAX_DIMS: usize = 20;

/// Maximum length of the origin string kept in metadata (bytes)
pub const MAX_ORIGIN_LENGTH: usize = 79;

/// Reference to a shared variable: the table it lives in and its key.
///
/// Immutable once constructed; used as the key of cache entries,
/// pending requests and subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarRef {
    table: String,
    key: String,
}

impl VarRef {
    /// Create a reference from a table name and a key
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let key = key.into();

        if table.is_empty() {
            return Err(SmaxError::InvalidName("table name is empty".to_string()));
        }
        if key.is_empty() {
            return Err(SmaxError::InvalidName(format!(
                "key is empty (table '{}')",
                table
            )));
        }
        if key.contains(SEPARATOR) {
            return Err(SmaxError::InvalidName(format!(
                "key '{}' contains the group separator",
                key
            )));
        }

        Ok(Self { table, key })
    }

    /// Parse a fully qualified `table:key` id, splitting on the last separator
    pub fn parse(id: &str) -> Result<Self> {
        match id.rfind(SEPARATOR) {
            Some(pos) => Self::new(&id[..pos], &id[pos + SEPARATOR.len()..]),
            None => Err(SmaxError::InvalidName(format!(
                "'{}' has no table part",
                id
            ))),
        }
    }

    /// The hash table the variable is stored in
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The variable's key within its table
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fully qualified id (`table:key`)
    pub fn id(&self) -> String {
        format!("{}{}{}", self.table, SEPARATOR, self.key)
    }

    /// Whether this variable belongs to `group`, directly or through nesting
    pub fn is_in_group(&self, group: &str) -> bool {
        if group.is_empty() {
            return false;
        }
        self.table == group
            || (self.table.len() > group.len()
                && self.table.starts_with(group)
                && self.table[group.len()..].starts_with(SEPARATOR))
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.table, SEPARATOR, self.key)
    }
}

impl FromStr for VarRef {
    type Err = SmaxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Stored element type of a shared variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TypeTag {
    /// Boolean value
    Boolean,
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Text value(s)
    String,
    /// Uninterpreted bytes
    #[default]
    Raw,
    /// Aggregate of nested fields
    Struct,
}

impl TypeTag {
    /// Returns the element size in bytes for fixed-size types
    pub fn size_bytes(&self) -> Option<usize> {
        match self {
            TypeTag::Boolean | TypeTag::Int8 => Some(1),
            TypeTag::Int16 => Some(2),
            TypeTag::Int32 | TypeTag::Float32 => Some(4),
            TypeTag::Int64 | TypeTag::Float64 => Some(8),
            TypeTag::String | TypeTag::Raw | TypeTag::Struct => None,
        }
    }

    /// Returns true for integer and floating point types
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TypeTag::Int8
                | TypeTag::Int16
                | TypeTag::Int32
                | TypeTag::Int64
                | TypeTag::Float32
                | TypeTag::Float64
        )
    }

    /// Name of the type as stored alongside the value
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Boolean => "boolean",
            TypeTag::Int8 => "int8",
            TypeTag::Int16 => "int16",
            TypeTag::Int32 => "int32",
            TypeTag::Int64 => "int64",
            TypeTag::Float32 => "float32",
            TypeTag::Float64 => "float64",
            TypeTag::String => "string",
            TypeTag::Raw => "raw",
            TypeTag::Struct => "struct",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeTag {
    type Err = SmaxError;

    fn from_str(s: &str) -> Result<Self> {
        // Accept the legacy aliases still written by older clients
        Ok(match s.trim() {
            "boolean" | "bool" => TypeTag::Boolean,
            "int8" | "byte" => TypeTag::Int8,
            "int16" | "short" => TypeTag::Int16,
            "int32" | "int" => TypeTag::Int32,
            "int64" | "long" => TypeTag::Int64,
            "float32" | "float" => TypeTag::Float32,
            "float64" | "double" => TypeTag::Float64,
            "string" | "str" => TypeTag::String,
            "raw" => TypeTag::Raw,
            "struct" => TypeTag::Struct,
            other => {
                return Err(SmaxError::Decode(format!("unknown type tag '{}'", other)));
            }
        })
    }
}

/// Metadata attached to every pulled value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Element type as stored
    pub type_tag: TypeTag,
    /// Sizes along each dimension (at most [`MAX_DIMS`])
    pub dims: Vec<usize>,
    /// Time of the last modification
    pub timestamp: DateTime<Utc>,
    /// Who last modified the value
    pub origin: String,
    /// Number of times the value was written (monotonically increasing)
    pub serial: u64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            type_tag: TypeTag::Raw,
            dims: vec![1],
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            origin: String::new(),
            serial: 0,
        }
    }
}

impl Metadata {
    /// Total number of elements described by the dimensions
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Parse space/comma separated dimensions, e.g. `"3 4"`
    pub fn parse_dims(text: &str) -> Result<Vec<usize>> {
        let dims: Vec<usize> = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| SmaxError::Decode(format!("invalid dimension '{}'", s)))
            })
            .collect::<Result<_>>()?;

        if dims.len() > MAX_DIMS {
            return Err(SmaxError::Decode(format!(
                "{} dimensions exceed the maximum of {}",
                dims.len(),
                MAX_DIMS
            )));
        }

        if dims.is_empty() {
            Ok(vec![1])
        } else {
            Ok(dims)
        }
    }

    /// Format dimensions the way they are stored
    pub fn format_dims(dims: &[usize]) -> String {
        dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse a `seconds.fraction` UNIX timestamp
    pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
        let text = text.trim();
        let (secs, frac) = match text.split_once('.') {
            Some((s, f)) => (s, f),
            None => (text, ""),
        };

        let secs: i64 = secs
            .parse()
            .map_err(|_| SmaxError::Decode(format!("invalid timestamp '{}'", text)))?;

        // Right-pad or truncate the fraction to nanoseconds
        let mut nanos: u32 = 0;
        if !frac.is_empty() {
            let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
            nanos = digits
                .parse()
                .map_err(|_| SmaxError::Decode(format!("invalid timestamp '{}'", text)))?;
        }

        Utc.timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| SmaxError::Decode(format!("timestamp out of range '{}'", text)))
    }

    /// Format a timestamp as `seconds.microseconds`
    pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
        format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
    }

    /// Set the origin, truncating to [`MAX_ORIGIN_LENGTH`] bytes
    pub fn set_origin(&mut self, origin: &str) {
        let mut end = origin.len().min(MAX_ORIGIN_LENGTH);
        while !origin.is_char_boundary(end) {
            end -= 1;
        }
        self.origin = origin[..end].to_string();
    }
}

/// A value pulled from the store: stored bytes plus metadata
#[derive(Debug, Clone, PartialEq)]
pub struct PulledValue {
    /// The variable the value belongs to
    pub var: VarRef,
    /// Serialized value, exactly as stored
    pub bytes: Vec<u8>,
    /// Metadata describing the bytes
    pub meta: Metadata,
}

impl PulledValue {
    /// Stored bytes interpreted as UTF-8 text
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.bytes)
            .map_err(|e| SmaxError::Decode(format!("{} is not valid UTF-8: {}", self.var, e)))
    }
}

/// Serialized value to share, with its type and shape
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Serialized value
    pub bytes: Vec<u8>,
    /// Element type
    pub type_tag: TypeTag,
    /// Sizes along each dimension
    pub dims: Vec<usize>,
}

impl Payload {
    /// Create a payload for a scalar of the given type
    pub fn scalar(bytes: impl Into<Vec<u8>>, type_tag: TypeTag) -> Self {
        Self {
            bytes: bytes.into(),
            type_tag,
            dims: vec![1],
        }
    }

    /// Create a payload with explicit dimensions
    pub fn array(bytes: impl Into<Vec<u8>>, type_tag: TypeTag, dims: Vec<usize>) -> Result<Self> {
        if dims.len() > MAX_DIMS {
            return Err(SmaxError::Decode(format!(
                "{} dimensions exceed the maximum of {}",
                dims.len(),
                MAX_DIMS
            )));
        }
        Ok(Self {
            bytes: bytes.into(),
            type_tag,
            dims,
        })
    }
}

/// Update notification for a variable
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    /// The variable that changed
    pub var: VarRef,
    /// Origin reported by the writer (notification payload)
    pub origin: String,
    /// Local arrival time
    pub received_at: DateTime<Utc>,
    /// Arrival sequence number, increasing across all events of a session
    pub sequence: u64,
}

/// Connection status reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,
    /// Connected and operational
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connected => write!(f, "Connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_ref_parse_last_separator() {
        let v = VarRef::parse("system:subsystem:var").unwrap();
        assert_eq!(v.table(), "system:subsystem");
        assert_eq!(v.key(), "var");
        assert_eq!(v.id(), "system:subsystem:var");
        assert_eq!(v.to_string(), "system:subsystem:var");
    }

    #[test]
    fn test_var_ref_rejects_bad_names() {
        assert!(VarRef::parse("nogroup").is_err());
        assert!(VarRef::parse(":key").is_err());
        assert!(VarRef::parse("table:").is_err());
        assert!(VarRef::new("table", "a:b").is_err());
    }

    #[test]
    fn test_group_membership() {
        let v = VarRef::new("weather:station1", "temp").unwrap();
        assert!(v.is_in_group("weather"));
        assert!(v.is_in_group("weather:station1"));
        assert!(!v.is_in_group("weath"));
        assert!(!v.is_in_group("weather:station"));
        assert!(!v.is_in_group(""));
    }

    #[test]
    fn test_type_tag_roundtrip_names() {
        for tag in [
            TypeTag::Boolean,
            TypeTag::Int8,
            TypeTag::Int16,
            TypeTag::Int32,
            TypeTag::Int64,
            TypeTag::Float32,
            TypeTag::Float64,
            TypeTag::String,
            TypeTag::Raw,
            TypeTag::Struct,
        ] {
            assert_eq!(tag.as_str().parse::<TypeTag>().unwrap(), tag);
        }
        assert_eq!("double".parse::<TypeTag>().unwrap(), TypeTag::Float64);
        assert!("quaternion".parse::<TypeTag>().is_err());
    }

    #[test]
    fn test_parse_dims() {
        assert_eq!(Metadata::parse_dims("3 4").unwrap(), vec![3, 4]);
        assert_eq!(Metadata::parse_dims("").unwrap(), vec![1]);
        assert_eq!(Metadata::parse_dims("2,5").unwrap(), vec![2, 5]);
        assert!(Metadata::parse_dims("x").is_err());

        let too_many = vec!["1"; MAX_DIMS + 1].join(" ");
        assert!(Metadata::parse_dims(&too_many).is_err());
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = Metadata::parse_timestamp("1700000000.25").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 250);

        let ts = Metadata::parse_timestamp("42").unwrap();
        assert_eq!(ts.timestamp(), 42);

        assert!(Metadata::parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_origin_truncation() {
        let mut meta = Metadata::default();
        meta.set_origin(&"x".repeat(200));
        assert_eq!(meta.origin.len(), MAX_ORIGIN_LENGTH);
    }

    #[test]
    fn test_element_count() {
        let meta = Metadata {
            dims: vec![3, 4],
            ..Default::default()
        };
        assert_eq!(meta.element_count(), 12);
    }
}
