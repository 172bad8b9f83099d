//! Binary payload codec.
//!
//! Payloads are described by an ordered list of field specifiers in the
//! style of the Tinkerforge API bindings:
//!
//! | Specifier | Meaning                                  | Value            |
//! |-----------|------------------------------------------|------------------|
//! | `b` `B`   | `i8` / `u8`                              | `I8` / `U8`      |
//! | `h` `H`   | `i16` / `u16`                            | `I16` / `U16`    |
//! | `i` `I`   | `i32` / `u32`                            | `I32` / `U32`    |
//! | `q` `Q`   | `i64` / `u64`                            | `I64` / `U64`    |
//! | `f` `d`   | `f32` / `f64`                            | `F32` / `F64`    |
//! | `?`       | bool, one byte                           | `Bool`           |
//! | `c`       | Latin-1 character, one byte              | `Char`           |
//! | `Ns`      | fixed-width string, NUL padded           | `String`         |
//! | `!`       | single bool stored in one byte           | `Bool`           |
//! | `N!`      | bool array packed 8 bits per byte        | `Array(Bool..)`  |
//!
//! A numeric prefix `N > 1` on any other type turns the field into an array
//! of `N` values. All integers are little-endian.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::packet::MAX_PAYLOAD_LEN;

/// Errors produced while parsing formats or (un)packing payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A field specifier could not be parsed.
    #[error("invalid format specifier \"{spec}\"")]
    InvalidSpecifier {
        /// The offending specifier.
        spec: String,
    },

    /// The number of values does not match the number of fields.
    #[error("mismatch between pack-format length and value count: {expected} != {actual}")]
    ArityMismatch {
        /// Number of fields in the format.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// An array value has the wrong number of items.
    #[error("field {index} (\"{spec}\") expects {expected} items, got {actual}")]
    ArrayLengthMismatch {
        /// Field index.
        index: usize,
        /// Field specifier.
        spec: String,
        /// Declared item count.
        expected: usize,
        /// Supplied item count.
        actual: usize,
    },

    /// A value cannot be stored in the field's type.
    #[error("field {index} (\"{spec}\") cannot hold {value}")]
    TypeMismatch {
        /// Field index.
        index: usize,
        /// Field specifier.
        spec: String,
        /// Debug rendering of the rejected value.
        value: String,
    },

    /// The payload ended before all fields were read.
    #[error("payload too short for field {index} (\"{spec}\"): need {needed} bytes, {available} left")]
    Truncated {
        /// Field index.
        index: usize,
        /// Field specifier.
        spec: String,
        /// Bytes required by the field.
        needed: usize,
        /// Bytes remaining in the payload.
        available: usize,
    },

    /// Bytes remained after all fields were read.
    #[error("non-unpacked payload left over: {remaining} bytes")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },
}

impl CodecError {
    /// Returns `true` if the error was raised while decoding a payload.
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::TrailingBytes { .. })
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Primitive type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// `?`
    Bool,
    /// `!`
    BitBool,
    /// `b`
    I8,
    /// `B`
    U8,
    /// `h`
    I16,
    /// `H`
    U16,
    /// `i`
    I32,
    /// `I`
    U32,
    /// `q`
    I64,
    /// `Q`
    U64,
    /// `f`
    F32,
    /// `d`
    F64,
    /// `c`
    Char,
    /// `s`
    String,
}

impl FieldType {
    const fn from_code(code: char) -> Option<Self> {
        Some(match code {
            '?' => Self::Bool,
            '!' => Self::BitBool,
            'b' => Self::I8,
            'B' => Self::U8,
            'h' => Self::I16,
            'H' => Self::U16,
            'i' => Self::I32,
            'I' => Self::U32,
            'q' => Self::I64,
            'Q' => Self::U64,
            'f' => Self::F32,
            'd' => Self::F64,
            'c' => Self::Char,
            's' => Self::String,
            _ => return None,
        })
    }

    /// Size of a single element in bytes.
    const fn element_size(self) -> usize {
        match self {
            Self::Bool | Self::BitBool | Self::I8 | Self::U8 | Self::Char | Self::String => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Inclusive integer range of the type, if it is an integer type.
    const fn int_range(self) -> Option<(i128, i128)> {
        Some(match self {
            Self::I8 => (i8::MIN as i128, i8::MAX as i128),
            Self::U8 => (0, u8::MAX as i128),
            Self::I16 => (i16::MIN as i128, i16::MAX as i128),
            Self::U16 => (0, u16::MAX as i128),
            Self::I32 => (i32::MIN as i128, i32::MAX as i128),
            Self::U32 => (0, u32::MAX as i128),
            Self::I64 => (i64::MIN as i128, i64::MAX as i128),
            Self::U64 => (0, u64::MAX as i128),
            _ => return None,
        })
    }
}

/// A single parsed field specifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    spec: String,
    ty: FieldType,
    count: usize,
    array: bool,
}

impl Field {
    /// Parses one specifier such as `"3B"`, `"8s"` or `"10!"`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidSpecifier`] for unknown type codes, a zero
    /// count, malformed counts, or counts that cannot fit into a packet.
    pub fn parse(spec: &str) -> CodecResult<Self> {
        let invalid = || CodecError::InvalidSpecifier {
            spec: spec.to_string(),
        };

        let code = spec.chars().last().ok_or_else(invalid)?;
        let ty = FieldType::from_code(code).ok_or_else(invalid)?;
        let prefix = &spec[..spec.len() - code.len_utf8()];

        let explicit_count = if prefix.is_empty() {
            None
        } else {
            if !prefix.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            Some(prefix.parse::<usize>().map_err(|_| invalid())?)
        };

        let count = explicit_count.unwrap_or(1);
        let max_count = match ty {
            FieldType::BitBool => MAX_PAYLOAD_LEN * 8,
            _ => MAX_PAYLOAD_LEN,
        };
        if count == 0 || count > max_count {
            return Err(invalid());
        }

        let array = match ty {
            FieldType::String => false,
            FieldType::BitBool => explicit_count.is_some(),
            _ => count > 1,
        };

        Ok(Self {
            spec: spec.to_string(),
            ty,
            count,
            array,
        })
    }

    /// Returns the original specifier text.
    #[must_use]
    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Returns the primitive type.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        self.ty
    }

    /// Returns the declared count (array length, string width or bit count).
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` if the field holds a [`Value::Array`].
    #[must_use]
    pub const fn is_array(&self) -> bool {
        self.array
    }

    /// Encoded size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self.ty {
            FieldType::BitBool if self.array => self.count.div_ceil(8),
            FieldType::BitBool => 1,
            ty => ty.element_size().saturating_mul(self.count),
        }
    }

    fn pack_into(&self, index: usize, value: &Value, out: &mut Vec<u8>) -> CodecResult<()> {
        match self.ty {
            FieldType::String => {
                let Value::String(text) = value else {
                    return Err(self.type_mismatch(index, value));
                };
                let mut bytes = latin1_encode(text).ok_or_else(|| self.type_mismatch(index, value))?;
                bytes.resize(self.count, 0);
                out.extend_from_slice(&bytes);
                Ok(())
            },
            FieldType::BitBool if self.array => {
                let items = self.array_items(index, value)?;
                let mut packed = vec![0u8; self.size()];
                for (bit, item) in items.iter().enumerate() {
                    if truthy(item).ok_or_else(|| self.type_mismatch(index, item))? {
                        packed[bit / 8] |= 1 << (bit % 8);
                    }
                }
                out.extend_from_slice(&packed);
                Ok(())
            },
            _ if self.array => {
                for item in self.array_items(index, value)? {
                    self.pack_element(index, item, out)?;
                }
                Ok(())
            },
            _ => self.pack_element(index, value, out),
        }
    }

    fn array_items<'v>(&self, index: usize, value: &'v Value) -> CodecResult<&'v [Value]> {
        let Value::Array(items) = value else {
            return Err(self.type_mismatch(index, value));
        };
        if items.len() != self.count {
            return Err(CodecError::ArrayLengthMismatch {
                index,
                spec: self.spec.clone(),
                expected: self.count,
                actual: items.len(),
            });
        }
        Ok(items)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn pack_element(&self, index: usize, value: &Value, out: &mut Vec<u8>) -> CodecResult<()> {
        match self.ty {
            FieldType::Bool | FieldType::BitBool => {
                let flag = truthy(value).ok_or_else(|| self.type_mismatch(index, value))?;
                out.put_u8(u8::from(flag));
            },
            FieldType::Char => {
                let Value::Char(c) = value else {
                    return Err(self.type_mismatch(index, value));
                };
                let byte = u8::try_from(u32::from(*c)).map_err(|_| self.type_mismatch(index, value))?;
                out.put_u8(byte);
            },
            FieldType::F32 => {
                let number = value.as_f64().ok_or_else(|| self.type_mismatch(index, value))?;
                out.put_f32_le(number as f32);
            },
            FieldType::F64 => {
                let number = value.as_f64().ok_or_else(|| self.type_mismatch(index, value))?;
                out.put_f64_le(number);
            },
            FieldType::String => return Err(self.type_mismatch(index, value)),
            ty => {
                let number = value.as_i128().ok_or_else(|| self.type_mismatch(index, value))?;
                let (min, max) = ty.int_range().ok_or_else(|| self.type_mismatch(index, value))?;
                if number < min || number > max {
                    return Err(self.type_mismatch(index, value));
                }
                match ty {
                    FieldType::I8 => out.put_i8(number as i8),
                    FieldType::U8 => out.put_u8(number as u8),
                    FieldType::I16 => out.put_i16_le(number as i16),
                    FieldType::U16 => out.put_u16_le(number as u16),
                    FieldType::I32 => out.put_i32_le(number as i32),
                    FieldType::U32 => out.put_u32_le(number as u32),
                    FieldType::I64 => out.put_i64_le(number as i64),
                    _ => out.put_u64_le(number as u64),
                }
            },
        }
        Ok(())
    }

    fn unpack_from(&self, index: usize, buf: &mut &[u8]) -> CodecResult<Value> {
        let needed = self.size();
        if buf.remaining() < needed {
            return Err(CodecError::Truncated {
                index,
                spec: self.spec.clone(),
                needed,
                available: buf.remaining(),
            });
        }

        Ok(match self.ty {
            FieldType::String => {
                let raw = &buf[..needed];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(needed);
                let text = raw[..end].iter().copied().map(char::from).collect();
                buf.advance(needed);
                Value::String(text)
            },
            FieldType::BitBool if self.array => {
                let raw = &buf[..needed];
                let bits = (0..self.count)
                    .map(|bit| Value::Bool(raw[bit / 8] & (1 << (bit % 8)) != 0))
                    .collect();
                buf.advance(needed);
                Value::Array(bits)
            },
            _ if self.array => Value::Array(
                (0..self.count)
                    .map(|_| self.unpack_element(buf))
                    .collect(),
            ),
            _ => self.unpack_element(buf),
        })
    }

    /// Reads one element; the caller has checked the remaining length.
    fn unpack_element(&self, buf: &mut &[u8]) -> Value {
        match self.ty {
            FieldType::Bool | FieldType::BitBool => Value::Bool(buf.get_u8() != 0),
            FieldType::Char | FieldType::String => Value::Char(char::from(buf.get_u8())),
            FieldType::I8 => Value::I8(buf.get_i8()),
            FieldType::U8 => Value::U8(buf.get_u8()),
            FieldType::I16 => Value::I16(buf.get_i16_le()),
            FieldType::U16 => Value::U16(buf.get_u16_le()),
            FieldType::I32 => Value::I32(buf.get_i32_le()),
            FieldType::U32 => Value::U32(buf.get_u32_le()),
            FieldType::I64 => Value::I64(buf.get_i64_le()),
            FieldType::U64 => Value::U64(buf.get_u64_le()),
            FieldType::F32 => Value::F32(buf.get_f32_le()),
            FieldType::F64 => Value::F64(buf.get_f64_le()),
        }
    }

    fn type_mismatch(&self, index: usize, value: &Value) -> CodecError {
        CodecError::TypeMismatch {
            index,
            spec: self.spec.clone(),
            value: format!("{value:?}"),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

/// An ordered list of fields describing a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Format {
    fields: Vec<Field>,
}

impl Format {
    /// The empty format (no payload).
    #[must_use]
    pub const fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// Parses a whitespace-separated format such as `"8s 8s c 3B 3B H"`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidSpecifier`] for the first bad specifier.
    pub fn parse(text: &str) -> CodecResult<Self> {
        Self::from_specs(text.split_whitespace())
    }

    /// Builds a format from individual specifiers.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidSpecifier`] for the first bad specifier.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a str>) -> CodecResult<Self> {
        let fields = specs
            .into_iter()
            .map(Field::parse)
            .collect::<CodecResult<Vec<_>>>()?;
        Ok(Self { fields })
    }

    /// Returns the fields.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the format has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.fields.iter().map(Field::size).fold(0, usize::saturating_add)
    }

    /// Packs `values` according to this format.
    ///
    /// # Errors
    ///
    /// Returns an error on arity, array length or type mismatches.
    pub fn pack(&self, values: &[Value]) -> CodecResult<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(CodecError::ArityMismatch {
                expected: self.fields.len(),
                actual: values.len(),
            });
        }

        let mut out = Vec::with_capacity(self.size());
        for (index, (field, value)) in self.fields.iter().zip(values).enumerate() {
            field.pack_into(index, value, &mut out)?;
        }
        Ok(out)
    }

    /// Unpacks `payload` according to this format.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too short or has bytes left over.
    pub fn unpack(&self, payload: &[u8]) -> CodecResult<Vec<Value>> {
        let mut buf = payload;
        let values = self
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| field.unpack_from(index, &mut buf))
            .collect::<CodecResult<Vec<_>>>()?;

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes {
                remaining: buf.remaining(),
            });
        }
        Ok(values)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(field.spec())?;
        }
        Ok(())
    }
}

impl FromStr for Format {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Packs `values` according to `format`.
///
/// # Errors
///
/// See [`Format::pack`].
pub fn pack(format: &Format, values: &[Value]) -> CodecResult<Vec<u8>> {
    format.pack(values)
}

/// Unpacks `payload` according to `format`.
///
/// # Errors
///
/// See [`Format::unpack`].
pub fn unpack(format: &Format, payload: &[u8]) -> CodecResult<Vec<Value>> {
    format.unpack(payload)
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `?` and `!` fields.
    Bool(bool),
    /// `b` fields.
    I8(i8),
    /// `B` fields.
    U8(u8),
    /// `h` fields.
    I16(i16),
    /// `H` fields.
    U16(u16),
    /// `i` fields.
    I32(i32),
    /// `I` fields.
    U32(u32),
    /// `q` fields.
    I64(i64),
    /// `Q` fields.
    U64(u64),
    /// `f` fields.
    F32(f32),
    /// `d` fields.
    F64(f64),
    /// `c` fields (Latin-1).
    Char(char),
    /// `s` fields (Latin-1, NUL trimmed).
    String(String),
    /// Array fields.
    Array(Vec<Self>),
}

impl Value {
    /// Returns the value as a wide integer if it is an integer or bool.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Self::Bool(v) => i128::from(v),
            Self::I8(v) => i128::from(v),
            Self::U8(v) => i128::from(v),
            Self::I16(v) => i128::from(v),
            Self::U16(v) => i128::from(v),
            Self::I32(v) => i128::from(v),
            Self::U32(v) => i128::from(v),
            Self::I64(v) => i128::from(v),
            Self::U64(v) => i128::from(v),
            _ => return None,
        })
    }

    /// Returns the value as a float if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(f64::from(v)),
            Self::F64(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Returns the string slice of a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }

            impl TryFrom<&Value> for $ty {
                type Error = CodecError;

                fn try_from(value: &Value) -> Result<Self, Self::Error> {
                    value
                        .as_i128()
                        .and_then(|v| <$ty>::try_from(v).ok())
                        .ok_or_else(|| CodecError::TypeMismatch {
                            index: 0,
                            spec: stringify!($ty).to_string(),
                            value: format!("{value:?}"),
                        })
                }
            }
        )*
    };
}

value_conversions! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Self::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<Self>, const N: usize> From<[T; N]> for Value {
    fn from(items: [T; N]) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl TryFrom<&Value> for bool {
    type Error = CodecError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        truthy(value).ok_or_else(|| CodecError::TypeMismatch {
            index: 0,
            spec: "bool".to_string(),
            value: format!("{value:?}"),
        })
    }
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        other => other.as_i128().map(|v| v != 0),
    }
}

fn latin1_encode(text: &str) -> Option<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}
