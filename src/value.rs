//! Self-describing values carried in request arguments and reply payloads.
//!
//! The frame codec only needs three things from a value encoding: an exact
//! size, an encoder that writes into a caller-sized buffer, and a decoder that
//! reads one value off the front of a byte slice. [`ValueCodec`] captures
//! that, so both ends of a connection can agree on any encoding they like.
//! [`PodCodec`] is the default.
//!
//! # PodCodec layout
//!
//! ```text
//! [u32 LE body_size] [u32 LE type] [body ...] [zero pad to 8-byte boundary]
//! ```
//!
//! | Type | Tag | Body |
//! |---|---|---|
//! | None | 1 | empty |
//! | Bool | 2 | i32 (0 or 1) |
//! | Int | 4 | i32 |
//! | Long | 5 | i64 |
//! | Double | 7 | f64 |
//! | String | 8 | UTF-8 bytes + NUL |
//! | Struct | 14 | child values, each padded |

use std::fmt;

use thiserror::Error;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    None,
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Double precision float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Struct(Vec<Value>),
}

impl Value {
    /// True for [`Value::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer, if this is an `Int`.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The integer, widened, if this is an `Int` or a `Long`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i64::from(*i)),
            Self::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// The float, if this is a `Double`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// The string slice, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The fields, if this is a `Struct`.
    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Self::Struct(fields) => Some(fields),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(l) => write!(f, "{l}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Struct(fields) => {
                write!(f, "[")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Self::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(fields: Vec<Value>) -> Self {
        Self::Struct(fields)
    }
}

/// JSON to `Value`: integers narrow to `Int` when they fit, objects become a
/// struct of `[key, value]` pairs in document order.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map_or(Self::Long(i), Self::Int)
                } else {
                    Self::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Struct(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Struct(
                map.into_iter()
                    .map(|(k, v)| Self::Struct(vec![Self::String(k), Self::from(v)]))
                    .collect(),
            ),
        }
    }
}

/// Value encoding or decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The output buffer cannot hold the encoded value.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// The input ended before the value did.
    #[error("truncated value: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the header announced.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Unrecognised type tag.
    #[error("unknown value type {0}")]
    UnknownType(u32),

    /// A fixed-size body had the wrong length.
    #[error("bad body size {size} for type {ty}")]
    BadSize {
        /// Type tag.
        ty: u32,
        /// Announced body size.
        size: usize,
    },

    /// String body was not NUL-terminated UTF-8.
    #[error("invalid string body")]
    InvalidString,

    /// Struct nesting exceeds [`MAX_DEPTH`].
    #[error("value nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// Pluggable value encoding.
///
/// `encode` must never grow the buffer; callers size it with `size` (or a
/// larger upper bound) beforehand.
pub trait ValueCodec: Send + Sync {
    /// Exact number of bytes `encode` writes for `value`.
    fn size(&self, value: &Value) -> usize;

    /// Encode `value` at the start of `out`, returning bytes written.
    fn encode(&self, value: &Value, out: &mut [u8]) -> Result<usize, CodecError>;

    /// Decode one value from the start of `input`, returning it with the
    /// number of bytes consumed. Trailing bytes are left alone.
    fn decode(&self, input: &[u8]) -> Result<(Value, usize), CodecError>;
}

/// Maximum struct nesting accepted by [`PodCodec::decode`].
pub const MAX_DEPTH: usize = 64;

const HEADER_SIZE: usize = 8;

mod tag {
    pub const NONE: u32 = 1;
    pub const BOOL: u32 = 2;
    pub const INT: u32 = 4;
    pub const LONG: u32 = 5;
    pub const DOUBLE: u32 = 7;
    pub const STRING: u32 = 8;
    pub const STRUCT: u32 = 14;
}

/// Default 8-byte aligned, tag-length-value codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodCodec;

fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

impl PodCodec {
    fn body_size(value: &Value) -> usize {
        match value {
            Value::None => 0,
            Value::Bool(_) | Value::Int(_) => 4,
            Value::Long(_) | Value::Double(_) => 8,
            Value::String(s) => s.len() + 1,
            Value::Struct(fields) => fields.iter().map(Self::encoded_size).sum(),
        }
    }

    fn encoded_size(value: &Value) -> usize {
        HEADER_SIZE + pad8(Self::body_size(value))
    }

    fn decode_at(input: &[u8], depth: usize) -> Result<(Value, usize), CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }
        if input.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: input.len(),
            });
        }
        let size = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
        let ty = u32::from_le_bytes([input[4], input[5], input[6], input[7]]);
        let total = HEADER_SIZE + pad8(size);
        if total > input.len() {
            return Err(CodecError::Truncated {
                needed: total,
                available: input.len(),
            });
        }
        let body = &input[HEADER_SIZE..HEADER_SIZE + size];

        let fixed = |expected: usize| {
            if size == expected {
                Ok(())
            } else {
                Err(CodecError::BadSize { ty, size })
            }
        };

        let value = match ty {
            tag::NONE => {
                fixed(0)?;
                Value::None
            }
            tag::BOOL => {
                fixed(4)?;
                Value::Bool(i32::from_le_bytes([body[0], body[1], body[2], body[3]]) != 0)
            }
            tag::INT => {
                fixed(4)?;
                Value::Int(i32::from_le_bytes([body[0], body[1], body[2], body[3]]))
            }
            tag::LONG => {
                fixed(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(body);
                Value::Long(i64::from_le_bytes(raw))
            }
            tag::DOUBLE => {
                fixed(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(body);
                Value::Double(f64::from_le_bytes(raw))
            }
            tag::STRING => {
                let (last, text) = body.split_last().ok_or(CodecError::InvalidString)?;
                if *last != 0 {
                    return Err(CodecError::InvalidString);
                }
                let text = std::str::from_utf8(text)
                    .map_err(|_| CodecError::InvalidString)?;
                Value::String(text.to_owned())
            }
            tag::STRUCT => {
                let mut fields = Vec::new();
                let mut offset = 0;
                while offset < size {
                    let (field, used) = Self::decode_at(&body[offset..], depth + 1)?;
                    fields.push(field);
                    offset += used;
                }
                Value::Struct(fields)
            }
            other => return Err(CodecError::UnknownType(other)),
        };

        Ok((value, total))
    }
}

impl ValueCodec for PodCodec {
    fn size(&self, value: &Value) -> usize {
        Self::encoded_size(value)
    }

    fn encode(&self, value: &Value, out: &mut [u8]) -> Result<usize, CodecError> {
        let total = self.size(value);
        if out.len() < total {
            return Err(CodecError::BufferTooSmall {
                needed: total,
                available: out.len(),
            });
        }
        let body_size = Self::body_size(value);
        let ty = match value {
            Value::None => tag::NONE,
            Value::Bool(_) => tag::BOOL,
            Value::Int(_) => tag::INT,
            Value::Long(_) => tag::LONG,
            Value::Double(_) => tag::DOUBLE,
            Value::String(_) => tag::STRING,
            Value::Struct(_) => tag::STRUCT,
        };
        out[0..4].copy_from_slice(&(body_size as u32).to_le_bytes());
        out[4..8].copy_from_slice(&ty.to_le_bytes());

        let body = &mut out[HEADER_SIZE..total];
        body.fill(0);
        match value {
            Value::None => {}
            Value::Bool(b) => body[..4].copy_from_slice(&i32::from(*b).to_le_bytes()),
            Value::Int(i) => body[..4].copy_from_slice(&i.to_le_bytes()),
            Value::Long(l) => body[..8].copy_from_slice(&l.to_le_bytes()),
            Value::Double(d) => body[..8].copy_from_slice(&d.to_le_bytes()),
            Value::String(s) => body[..s.len()].copy_from_slice(s.as_bytes()),
            Value::Struct(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset += self.encode(field, &mut body[offset..])?;
                }
            }
        }

        Ok(total)
    }

    fn decode(&self, input: &[u8]) -> Result<(Value, usize), CodecError> {
        Self::decode_at(input, 0)
    }
}
