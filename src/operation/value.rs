#![forbid(unsafe_code)]

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{Result, TesseraError};

/// Declared type of a property column.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// `true` / `false`.
    Bool,
    /// Single character.
    Char,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 text.
    String,
    /// Raw bytes.
    Bytes,
    /// Days since the Unix epoch.
    Date,
}

impl DataType {
    fn tag(self) -> u8 {
        match self {
            DataType::Bool => 1,
            DataType::Char => 2,
            DataType::Short => 3,
            DataType::Int => 4,
            DataType::Long => 5,
            DataType::Float => 6,
            DataType::Double => 7,
            DataType::String => 8,
            DataType::Bytes => 9,
            DataType::Date => 10,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => DataType::Bool,
            2 => DataType::Char,
            3 => DataType::Short,
            4 => DataType::Int,
            5 => DataType::Long,
            6 => DataType::Float,
            7 => DataType::Double,
            8 => DataType::String,
            9 => DataType::Bytes,
            10 => DataType::Date,
            _ => return None,
        })
    }

    /// Writes the one-byte tag of this type.
    pub fn encode(self, out: &mut ByteWriter) {
        out.put_u8(self.tag());
    }

    /// Reads a tag written by [`DataType::encode`].
    pub fn decode(src: &mut ByteReader<'_>) -> Result<Self> {
        let tag = src.get_u8()?;
        DataType::from_tag(tag)
            .ok_or_else(|| TesseraError::malformed(format!("unknown data type tag {tag}")))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Char => "char",
            DataType::Short => "short",
            DataType::Int => "int",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Bytes => "bytes",
            DataType::Date => "date",
        };
        f.write_str(name)
    }
}

/// A single property value.
///
/// On the wire a value is a one-byte tag (0 for null, otherwise the
/// [`DataType`] tag) followed by a fixed-width big-endian body, or a `u32`
/// length and the raw bytes for strings and byte arrays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Character.
    Char(char),
    /// 16-bit integer.
    Short(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Text.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Days since the Unix epoch.
    Date(i32),
}

impl PropertyValue {
    /// Type of the value, `None` for [`PropertyValue::Null`].
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            PropertyValue::Null => return None,
            PropertyValue::Bool(_) => DataType::Bool,
            PropertyValue::Char(_) => DataType::Char,
            PropertyValue::Short(_) => DataType::Short,
            PropertyValue::Int(_) => DataType::Int,
            PropertyValue::Long(_) => DataType::Long,
            PropertyValue::Float(_) => DataType::Float,
            PropertyValue::Double(_) => DataType::Double,
            PropertyValue::String(_) => DataType::String,
            PropertyValue::Bytes(_) => DataType::Bytes,
            PropertyValue::Date(_) => DataType::Date,
        })
    }

    /// True for [`PropertyValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Converts the value into a column of type `target`.
    ///
    /// Integers and floats widen (short into int or long, int into long,
    /// float into double); any other mismatch is rejected. Null passes
    /// through unchanged.
    pub fn coerce_to(self, target: DataType) -> Result<PropertyValue> {
        let coerced = match (self, target) {
            (PropertyValue::Null, _) => PropertyValue::Null,
            (PropertyValue::Short(v), DataType::Int) => PropertyValue::Int(i32::from(v)),
            (PropertyValue::Short(v), DataType::Long) => PropertyValue::Long(i64::from(v)),
            (PropertyValue::Int(v), DataType::Long) => PropertyValue::Long(i64::from(v)),
            (PropertyValue::Float(v), DataType::Double) => PropertyValue::Double(f64::from(v)),
            (value, target) => {
                let actual = value.data_type();
                if actual != Some(target) {
                    return Err(TesseraError::malformed(format!(
                        "expected {target} value, got {}",
                        actual.map(|t| t.to_string()).unwrap_or_else(|| "null".into())
                    )));
                }
                value
            }
        };
        Ok(coerced)
    }

    /// Appends the tagged encoding of the value.
    pub fn encode(&self, out: &mut ByteWriter) -> Result<()> {
        match self.data_type() {
            None => out.put_u8(0),
            Some(ty) => ty.encode(out),
        }
        match self {
            PropertyValue::Null => {}
            PropertyValue::Bool(v) => out.put_bool(*v),
            PropertyValue::Char(v) => out.put_u32(u32::from(*v)),
            PropertyValue::Short(v) => out.put_i16(*v),
            PropertyValue::Int(v) => out.put_i32(*v),
            PropertyValue::Long(v) => out.put_i64(*v),
            PropertyValue::Float(v) => out.put_f32(*v),
            PropertyValue::Double(v) => out.put_f64(*v),
            PropertyValue::String(v) => out.put_len_prefixed(v.as_bytes())?,
            PropertyValue::Bytes(v) => out.put_len_prefixed(v)?,
            PropertyValue::Date(v) => out.put_i32(*v),
        }
        Ok(())
    }

    /// Reads a value written by [`PropertyValue::encode`].
    pub fn decode(src: &mut ByteReader<'_>) -> Result<Self> {
        let tag = src.get_u8()?;
        if tag == 0 {
            return Ok(PropertyValue::Null);
        }
        let ty = DataType::from_tag(tag)
            .ok_or_else(|| TesseraError::malformed(format!("unknown value tag {tag}")))?;
        Ok(match ty {
            DataType::Bool => PropertyValue::Bool(src.get_bool()?),
            DataType::Char => {
                let raw = src.get_u32()?;
                let ch = char::from_u32(raw)
                    .ok_or_else(|| TesseraError::malformed(format!("invalid char {raw:#x}")))?;
                PropertyValue::Char(ch)
            }
            DataType::Short => PropertyValue::Short(src.get_i16()?),
            DataType::Int => PropertyValue::Int(src.get_i32()?),
            DataType::Long => PropertyValue::Long(src.get_i64()?),
            DataType::Float => PropertyValue::Float(src.get_f32()?),
            DataType::Double => PropertyValue::Double(src.get_f64()?),
            DataType::String => {
                let raw = src.get_len_prefixed()?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| TesseraError::malformed("string value is not UTF-8"))?;
                PropertyValue::String(text.to_owned())
            }
            DataType::Bytes => PropertyValue::Bytes(src.get_len_prefixed()?.to_vec()),
            DataType::Date => PropertyValue::Date(src.get_i32()?),
        })
    }

    /// Standalone encoding, used for primary-key bytes.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut out = ByteWriter::new();
        self.encode(&mut out)?;
        Ok(out.into_bytes())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("null"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Char(v) => write!(f, "{v:?}"),
            PropertyValue::Short(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Long(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Double(v) => write!(f, "{v}"),
            PropertyValue::String(v) => write!(f, "{v:?}"),
            PropertyValue::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            PropertyValue::Date(v) => write!(f, "date({v})"),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}
