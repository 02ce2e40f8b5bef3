//! BAM header and reference dictionary.
//!
//! The BAM header consists of:
//! 1. Magic bytes ("BAM\1")
//! 2. SAM header text (opaque to this crate, stored and forwarded verbatim)
//! 3. Reference sequence dictionary
//!
//! # Format
//!
//! ```text
//! BAM Header:
//! - 4 bytes: Magic ("BAM\1")
//! - 4 bytes: SAM header text length (l_text, int32)
//! - l_text bytes: SAM header text
//! - 4 bytes: Number of reference sequences (n_ref, int32)
//! - For each reference:
//!   - 4 bytes: Reference name length (l_name, int32, includes null terminator)
//!   - l_name bytes: Reference name (null-terminated)
//!   - 4 bytes: Reference length (int32)
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::{BamError, Result};

/// BAM magic bytes.
pub const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// Reference sequence information.
///
/// A reference is identified by its 0-based position in the header's list
/// (its `ref_id`); `-1` stands for "no reference".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Reference sequence name (e.g., "chr1", "chrM")
    pub name: String,
    /// Reference sequence length in bases
    pub length: u32,
}

impl Reference {
    /// Create a new reference.
    pub fn new(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            length,
        }
    }
}

/// BAM file header: SAM text plus the reference dictionary.
///
/// The text is kept as raw bytes; it need not be valid UTF-8 and is written
/// back unchanged.
#[derive(Debug, Clone, Default)]
pub struct Header {
    text: Vec<u8>,
    references: Vec<Reference>,
    by_name: HashMap<String, usize>,
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.references == other.references
    }
}

impl Eq for Header {}

impl Header {
    /// Create a new header.
    pub fn new(text: impl Into<Vec<u8>>, references: Vec<Reference>) -> Self {
        let by_name = references
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        Self {
            text: text.into(),
            references,
            by_name,
        }
    }

    /// Header with text only and an empty reference list.
    pub fn from_text(text: impl Into<Vec<u8>>) -> Self {
        Self::new(text, Vec::new())
    }

    /// Replace the reference list.
    pub fn with_references(self, references: Vec<Reference>) -> Self {
        Self::new(self.text, references)
    }

    /// SAM header text, exactly as stored.
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    /// SAM header text with invalid UTF-8 replaced by U+FFFD.
    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }

    /// Reference list in `ref_id` order.
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Get reference by ID. Negative or out-of-bounds IDs give `None`.
    pub fn reference(&self, id: i32) -> Option<&Reference> {
        usize::try_from(id).ok().and_then(|i| self.references.get(i))
    }

    /// Get reference name by ID.
    pub fn reference_name(&self, id: i32) -> Option<&str> {
        self.reference(id).map(|r| r.name.as_str())
    }

    /// Resolve a reference name to its ID.
    pub fn reference_id(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).map(|&i| i as i32)
    }

    /// Get number of reference sequences.
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

/// Read and validate BAM magic bytes.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the magic does not match or the
/// stream is too short.
pub fn read_magic<R: Read>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != BAM_MAGIC {
        return Err(BamError::CorruptBlock(format!(
            "invalid BAM magic: expected {:?}, got {:?}",
            BAM_MAGIC, magic
        )));
    }
    Ok(())
}

/// Read SAM header text (length-prefixed) as raw bytes.
pub fn read_header_text<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_i32(reader)?;
    let len = usize::try_from(len)
        .map_err(|_| BamError::CorruptBlock(format!("invalid SAM header length: {}", len)))?;

    let mut text_bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut text_bytes)?;
    if text_bytes.len() != len {
        return Err(BamError::CorruptBlock(format!(
            "SAM header truncated: {} of {} bytes",
            text_bytes.len(),
            len
        )));
    }
    Ok(text_bytes)
}

/// Read a single reference sequence entry.
pub fn read_reference<R: Read>(reader: &mut R) -> Result<Reference> {
    let name_len = read_i32(reader)?;
    if name_len <= 0 {
        return Err(BamError::CorruptBlock(format!(
            "invalid reference name length: {}",
            name_len
        )));
    }

    let mut name_bytes = Vec::new();
    reader.by_ref().take(name_len as u64).read_to_end(&mut name_bytes)?;
    if name_bytes.len() != name_len as usize {
        return Err(BamError::CorruptBlock("reference name truncated".to_string()));
    }
    if name_bytes.pop() != Some(0) {
        return Err(BamError::CorruptBlock(
            "reference name not null-terminated".to_string(),
        ));
    }
    let name = String::from_utf8(name_bytes)
        .map_err(|e| BamError::CorruptBlock(format!("invalid UTF-8 in reference name: {}", e)))?;

    let length = read_i32(reader)?;
    if length < 0 {
        return Err(BamError::CorruptBlock(format!(
            "invalid reference length: {}",
            length
        )));
    }

    Ok(Reference::new(name, length as u32))
}

/// Read the reference count followed by every reference entry.
pub fn read_references<R: Read>(reader: &mut R) -> Result<Vec<Reference>> {
    let count = read_i32(reader)?;
    let count = usize::try_from(count)
        .map_err(|_| BamError::CorruptBlock(format!("invalid reference count: {}", count)))?;

    // Cap the preallocation; a corrupt count should fail on read, not on alloc
    let mut references = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        references.push(read_reference(reader)?);
    }
    Ok(references)
}

/// Read complete BAM header: magic, text and references.
pub fn read_header<R: Read>(reader: &mut R) -> Result<Header> {
    read_magic(reader)?;
    let text = read_header_text(reader)?;
    let references = read_references(reader)?;
    Ok(Header::new(text, references))
}

/// Write the length-prefixed SAM header text.
pub fn write_header_text<W: Write>(writer: &mut W, text: &[u8]) -> Result<()> {
    let len = i32::try_from(text.len())
        .map_err(|_| BamError::OutOfRange("SAM header text too long".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(text)?;
    Ok(())
}

/// Encode the reference count and entries.
///
/// # Errors
///
/// Returns [`BamError::OutOfRange`] for an empty name, a name containing
/// NUL, or a length above `i32::MAX`.
pub fn encode_references(references: &[Reference]) -> Result<Vec<u8>> {
    let count = i32::try_from(references.len())
        .map_err(|_| BamError::OutOfRange("too many references".to_string()))?;
    let mut out = Vec::new();
    out.extend_from_slice(&count.to_le_bytes());
    for reference in references {
        if reference.name.is_empty() || reference.name.contains('\0') {
            return Err(BamError::OutOfRange(format!(
                "invalid reference name {:?}",
                reference.name
            )));
        }
        let length = i32::try_from(reference.length).map_err(|_| {
            BamError::OutOfRange(format!("reference length {} too large", reference.length))
        })?;
        let name_len = (reference.name.len() + 1) as i32;
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(reference.name.as_bytes());
        out.push(0);
        out.extend_from_slice(&length.to_le_bytes());
    }
    Ok(out)
}
