//! BAM auxiliary tags.
//!
//! The tag block sits at the end of a record and is a run of entries:
//!
//! ```text
//! tag (2 bytes) | type (1 byte) | value
//! ```
//!
//! Scalar types are `A c C s S i I f`, strings are `Z` (NUL-terminated) and
//! `H` (hex digits, NUL-terminated), and `B` introduces an array: a subtype
//! byte (`cCsSiIf`), an element count (u32) and the packed elements.
//!
//! Each value kind also has a stable numeric [`TagType`] id; a key that is
//! not present reports [`TagType::Null`] rather than an error.

use std::fmt;

use crate::error::{BamError, Result};

/// Two-character tag key.
pub type TagKey = [u8; 2];

/// Numeric identifier of a tag's value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagType {
    /// `A`
    Char = 36,
    /// `c`
    Int8 = 48,
    /// `C`
    UInt8 = 32,
    /// `s`
    Int16 = 80,
    /// `S`
    UInt16 = 64,
    /// `i`
    Int32 = 144,
    /// `I`
    UInt32 = 128,
    /// `f`
    Float = 136,
    /// `Z`
    String = 37,
    /// `H`
    Hex = 45,
    /// `B:c`
    Int8Array = 49,
    /// `B:C`
    UInt8Array = 33,
    /// `B:s`
    Int16Array = 81,
    /// `B:S`
    UInt16Array = 65,
    /// `B:i`
    Int32Array = 145,
    /// `B:I`
    UInt32Array = 129,
    /// `B:f`
    FloatArray = 137,
    /// Key not present on the record
    Null = 2,
}

impl TagType {
    /// Numeric id.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            TagType::Char => "char",
            TagType::Int8 => "int8",
            TagType::UInt8 => "uint8",
            TagType::Int16 => "int16",
            TagType::UInt16 => "uint16",
            TagType::Int32 => "int32",
            TagType::UInt32 => "uint32",
            TagType::Float => "float",
            TagType::String => "string",
            TagType::Hex => "hex string",
            TagType::Int8Array => "int8 array",
            TagType::UInt8Array => "uint8 array",
            TagType::Int16Array => "int16 array",
            TagType::UInt16Array => "uint16 array",
            TagType::Int32Array => "int32 array",
            TagType::UInt32Array => "uint32 array",
            TagType::FloatArray => "float array",
            TagType::Null => "null",
        }
    }

    /// Whether values of this kind are arrays.
    pub fn is_array(self) -> bool {
        self.id() & 1 == 1 && !matches!(self, TagType::String | TagType::Hex)
    }
}

/// Tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Printable character (`A`)
    Char(u8),
    /// Signed 8-bit integer (`c`)
    Int8(i8),
    /// Unsigned 8-bit integer (`C`)
    UInt8(u8),
    /// Signed 16-bit integer (`s`)
    Int16(i16),
    /// Unsigned 16-bit integer (`S`)
    UInt16(u16),
    /// Signed 32-bit integer (`i`)
    Int32(i32),
    /// Unsigned 32-bit integer (`I`)
    UInt32(u32),
    /// Single-precision float (`f`)
    Float(f32),
    /// Text (`Z`)
    String(String),
    /// Hex digits (`H`)
    Hex(String),
    /// `B:c`
    Int8Array(Vec<i8>),
    /// `B:C`
    UInt8Array(Vec<u8>),
    /// `B:s`
    Int16Array(Vec<i16>),
    /// `B:S`
    UInt16Array(Vec<u16>),
    /// `B:i`
    Int32Array(Vec<i32>),
    /// `B:I`
    UInt32Array(Vec<u32>),
    /// `B:f`
    FloatArray(Vec<f32>),
}

impl TagValue {
    /// Kind of this value.
    pub fn tag_type(&self) -> TagType {
        match self {
            TagValue::Char(_) => TagType::Char,
            TagValue::Int8(_) => TagType::Int8,
            TagValue::UInt8(_) => TagType::UInt8,
            TagValue::Int16(_) => TagType::Int16,
            TagValue::UInt16(_) => TagType::UInt16,
            TagValue::Int32(_) => TagType::Int32,
            TagValue::UInt32(_) => TagType::UInt32,
            TagValue::Float(_) => TagType::Float,
            TagValue::String(_) => TagType::String,
            TagValue::Hex(_) => TagType::Hex,
            TagValue::Int8Array(_) => TagType::Int8Array,
            TagValue::UInt8Array(_) => TagType::UInt8Array,
            TagValue::Int16Array(_) => TagType::Int16Array,
            TagValue::UInt16Array(_) => TagType::UInt16Array,
            TagValue::Int32Array(_) => TagType::Int32Array,
            TagValue::UInt32Array(_) => TagType::UInt32Array,
            TagValue::FloatArray(_) => TagType::FloatArray,
        }
    }

    /// Any integer scalar widened to `i64`.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            TagValue::Int8(v) => Some(v as i64),
            TagValue::UInt8(v) => Some(v as i64),
            TagValue::Int16(v) => Some(v as i64),
            TagValue::UInt16(v) => Some(v as i64),
            TagValue::Int32(v) => Some(v as i64),
            TagValue::UInt32(v) => Some(v as i64),
            _ => None,
        }
    }

    /// Text of a `Z` or `H` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) | TagValue::Hex(s) => Some(s),
            _ => None,
        }
    }

    /// Check that the value can be encoded.
    fn validate(&self) -> Result<()> {
        match self {
            TagValue::Char(c) if !(b'!'..=b'~').contains(c) => Err(BamError::OutOfRange(format!(
                "char tag value {:#04x} is not printable",
                c
            ))),
            TagValue::String(s) if s.contains('\0') => Err(BamError::OutOfRange(
                "string tag value contains NUL".to_string(),
            )),
            TagValue::Hex(s) if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Err(BamError::OutOfRange(format!("invalid hex tag value {:?}", s)))
            }
            _ => Ok(()),
        }
    }

    /// Append type code(s) and the value bytes to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        fn array<T: Copy, const N: usize>(
            out: &mut Vec<u8>,
            sub: u8,
            values: &[T],
            to_le: impl Fn(T) -> [u8; N],
        ) -> Result<()> {
            let count = u32::try_from(values.len())
                .map_err(|_| BamError::OutOfRange("tag array too long".to_string()))?;
            out.push(b'B');
            out.push(sub);
            out.extend_from_slice(&count.to_le_bytes());
            for &v in values {
                out.extend_from_slice(&to_le(v));
            }
            Ok(())
        }

        match self {
            TagValue::Char(c) => out.extend_from_slice(&[b'A', *c]),
            TagValue::Int8(v) => out.extend_from_slice(&[b'c', *v as u8]),
            TagValue::UInt8(v) => out.extend_from_slice(&[b'C', *v]),
            TagValue::Int16(v) => {
                out.push(b's');
                out.extend_from_slice(&v.to_le_bytes());
            }
            TagValue::UInt16(v) => {
                out.push(b'S');
                out.extend_from_slice(&v.to_le_bytes());
            }
            TagValue::Int32(v) => {
                out.push(b'i');
                out.extend_from_slice(&v.to_le_bytes());
            }
            TagValue::UInt32(v) => {
                out.push(b'I');
                out.extend_from_slice(&v.to_le_bytes());
            }
            TagValue::Float(v) => {
                out.push(b'f');
                out.extend_from_slice(&v.to_le_bytes());
            }
            TagValue::String(s) => {
                out.push(b'Z');
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            TagValue::Hex(s) => {
                out.push(b'H');
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            TagValue::Int8Array(v) => array(out, b'c', v, |x: i8| x.to_le_bytes())?,
            TagValue::UInt8Array(v) => array(out, b'C', v, |x: u8| x.to_le_bytes())?,
            TagValue::Int16Array(v) => array(out, b's', v, |x: i16| x.to_le_bytes())?,
            TagValue::UInt16Array(v) => array(out, b'S', v, |x: u16| x.to_le_bytes())?,
            TagValue::Int32Array(v) => array(out, b'i', v, |x: i32| x.to_le_bytes())?,
            TagValue::UInt32Array(v) => array(out, b'I', v, |x: u32| x.to_le_bytes())?,
            TagValue::FloatArray(v) => array(out, b'f', v, |x: f32| x.to_le_bytes())?,
        }
        Ok(())
    }
}

/// SAM text form of the value part (`i:5`, `Z:text`, `B:c,1,2`).
impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, sub: char, values: &[T]) -> fmt::Result {
            write!(f, "B:{}", sub)?;
            for v in values {
                write!(f, ",{}", v)?;
            }
            Ok(())
        }

        match self {
            TagValue::Char(c) => write!(f, "A:{}", *c as char),
            TagValue::Float(v) => write!(f, "f:{}", v),
            TagValue::String(s) => write!(f, "Z:{}", s),
            TagValue::Hex(s) => write!(f, "H:{}", s),
            TagValue::Int8Array(v) => join(f, 'c', v),
            TagValue::UInt8Array(v) => join(f, 'C', v),
            TagValue::Int16Array(v) => join(f, 's', v),
            TagValue::UInt16Array(v) => join(f, 'S', v),
            TagValue::Int32Array(v) => join(f, 'i', v),
            TagValue::UInt32Array(v) => join(f, 'I', v),
            TagValue::FloatArray(v) => join(f, 'f', v),
            other => match other.as_int() {
                Some(v) => write!(f, "i:{}", v),
                None => Ok(()),
            },
        }
    }
}

/// Check that a key is `[A-Za-z][A-Za-z0-9]`.
pub fn validate_key(key: &TagKey) -> Result<()> {
    if key[0].is_ascii_alphabetic() && key[1].is_ascii_alphanumeric() {
        Ok(())
    } else {
        Err(BamError::OutOfRange(format!(
            "invalid tag key {:?}",
            String::from_utf8_lossy(key)
        )))
    }
}

fn truncated(what: &str) -> BamError {
    BamError::CorruptBlock(format!("tag block truncated inside {}", what))
}

fn scalar_size(type_code: u8) -> Option<usize> {
    match type_code {
        b'A' | b'c' | b'C' => Some(1),
        b's' | b'S' => Some(2),
        b'i' | b'I' | b'f' => Some(4),
        _ => None,
    }
}

/// Byte length of the value part of an entry (after the type code).
fn value_len(type_code: u8, data: &[u8]) -> Result<usize> {
    if let Some(size) = scalar_size(type_code) {
        return if data.len() >= size { Ok(size) } else { Err(truncated("scalar")) };
    }
    match type_code {
        b'Z' | b'H' => data
            .iter()
            .position(|&b| b == 0)
            .map(|nul| nul + 1)
            .ok_or_else(|| truncated("string")),
        b'B' => {
            if data.len() < 5 {
                return Err(truncated("array header"));
            }
            let size = scalar_size(data[0])
                .filter(|_| data[0] != b'A')
                .ok_or_else(|| {
                    BamError::CorruptBlock(format!("invalid array subtype {:?}", data[0] as char))
                })?;
            let count = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
            let total = count
                .checked_mul(size)
                .and_then(|n| n.checked_add(5))
                .ok_or_else(|| truncated("array"))?;
            if data.len() < total {
                return Err(truncated("array"));
            }
            Ok(total)
        }
        other => Err(BamError::CorruptBlock(format!(
            "invalid tag type {:?}",
            other as char
        ))),
    }
}

fn text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| BamError::CorruptBlock(format!("invalid UTF-8 in string tag: {}", e)))
}

/// Decode a value whose bytes (`data`) have already been bounds-checked by
/// [`value_len`].
fn decode_value(type_code: u8, data: &[u8]) -> Result<TagValue> {
    let value = match type_code {
        b'A' => TagValue::Char(data[0]),
        b'c' => TagValue::Int8(data[0] as i8),
        b'C' => TagValue::UInt8(data[0]),
        b's' => TagValue::Int16(i16::from_le_bytes([data[0], data[1]])),
        b'S' => TagValue::UInt16(u16::from_le_bytes([data[0], data[1]])),
        b'i' => TagValue::Int32(i32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        b'I' => TagValue::UInt32(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        b'f' => TagValue::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        b'Z' => TagValue::String(text(&data[..data.len() - 1])?),
        b'H' => TagValue::Hex(text(&data[..data.len() - 1])?),
        b'B' => {
            let items = &data[5..];
            match data[0] {
                b'c' => TagValue::Int8Array(items.iter().map(|&b| b as i8).collect()),
                b'C' => TagValue::UInt8Array(items.to_vec()),
                b's' => TagValue::Int16Array(
                    items.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect(),
                ),
                b'S' => TagValue::UInt16Array(
                    items.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
                ),
                b'i' => TagValue::Int32Array(
                    items
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                b'I' => TagValue::UInt32Array(
                    items
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                _ => TagValue::FloatArray(
                    items
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
            }
        }
        other => {
            return Err(BamError::CorruptBlock(format!(
                "invalid tag type {:?}",
                other as char
            )))
        }
    };
    Ok(value)
}

/// Location of one entry inside a tag block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagEntry {
    /// Tag key
    pub key: TagKey,
    /// Type code byte (`A`, `i`, `B`, ...)
    pub type_code: u8,
    /// Offset of the key within the block
    pub start: usize,
    /// Offset one past the last value byte
    pub end: usize,
}

impl TagEntry {
    /// Decode this entry's value from the block it was found in.
    pub fn value(&self, block: &[u8]) -> Result<TagValue> {
        decode_value(self.type_code, &block[self.start + 3..self.end])
    }
}

/// Walks the entries of a tag block, validating bounds as it goes.
#[derive(Debug, Clone)]
pub struct TagEntries<'a> {
    block: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> TagEntries<'a> {
    /// Walk `block` from the start.
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for TagEntries<'a> {
    type Item = Result<TagEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.block.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.block[start..];
        if rest.len() < 3 {
            self.failed = true;
            return Some(Err(truncated("tag header")));
        }
        let type_code = rest[2];
        match value_len(type_code, &rest[3..]) {
            Ok(len) => {
                self.pos = start + 3 + len;
                Some(Ok(TagEntry {
                    key: [rest[0], rest[1]],
                    type_code,
                    start,
                    end: self.pos,
                }))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Find the entry for `key`.
pub fn find_entry(block: &[u8], key: &TagKey) -> Result<Option<TagEntry>> {
    for entry in TagEntries::new(block) {
        let entry = entry?;
        if &entry.key == key {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Decode every tag in a block, in order.
pub fn parse_tags(block: &[u8]) -> Result<Vec<(TagKey, TagValue)>> {
    TagEntries::new(block)
        .map(|entry| entry.and_then(|e| Ok((e.key, e.value(block)?))))
        .collect()
}

/// Type id of `key` in a block, [`TagType::Null`] when absent.
pub fn entry_type(block: &[u8], key: &TagKey) -> Result<TagType> {
    let Some(entry) = find_entry(block, key)? else {
        return Ok(TagType::Null);
    };
    let value = entry.value(block)?;
    Ok(value.tag_type())
}
