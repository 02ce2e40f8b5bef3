//! BAM record structure, field access and in-place mutation.
//!
//! A BAM record represents a single alignment (read mapped to reference).
//! [`Record`] keeps the record in its binary form and answers field
//! queries straight from the bytes, using a small offset table computed
//! when the record is created or reshaped.
//!
//! # Binary Format
//!
//! ```text
//! BAM Record (binary, little-endian):
//! - block_size (int32): Total record size in bytes (excluding this field)
//! - refID (int32): Reference sequence ID (-1 for unmapped)
//! - pos (int32): 0-based leftmost position (-1 for unmapped)
//! - l_read_name (uint8): Length of read name (includes null terminator)
//! - mapq (uint8): Mapping quality (255 = unavailable)
//! - bin (uint16): BAI index bin (for indexing)
//! - n_cigar_op (uint16): Number of CIGAR operations
//! - flag (uint16): Bitwise FLAGS
//! - l_seq (int32): Sequence length
//! - next_refID (int32): Reference ID of mate/next read
//! - next_pos (int32): Position of mate/next read
//! - tlen (int32): Template length
//! - read_name (char[l_read_name]): Null-terminated read name
//! - cigar (uint32[n_cigar_op]): CIGAR operations
//! - seq (uint8[(l_seq+1)/2]): 4-bit encoded sequence
//! - qual (char[l_seq]): Phred quality scores
//! - tags: Optional tags (variable length)
//! ```
//!
//! The bytes held by a [`Record`] start at `refID`; `block_size` is only
//! present on disk.
//!
//! # Mutation
//!
//! Setters for fixed fields overwrite bytes in place. Setters for variable
//! fields (name, CIGAR, sequence, qualities, tags) splice the new content
//! into the buffer, growing or shrinking it, and fix up the length fields
//! and offset table. Anything borrowed from the record before a mutation is
//! invalidated by the borrow checker, so a stale view of the old buffer
//! cannot be observed.

use std::fmt;
use std::io::{Read, Write};
use std::ops::Range;

use super::cigar::{self, encode_cigar, format_cigar, parse_cigar, CigarOp};
use super::header::Reference;
use super::index::reg2bin;
use super::md;
use super::sequence::{base_at, encode_sequence};
use super::tags::{self, validate_key, TagKey, TagType, TagValue};
use crate::error::{BamError, Result};

/// Size of the fixed-length part of a record (after `block_size`).
pub const FIXED_FIELDS_SIZE: usize = 32;

/// Largest record body accepted when reading (guards corrupt length fields).
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Largest reference coordinate a record may reach (its end position).
pub const MAX_REFERENCE_END: i64 = i32::MAX as i64;

/// Quality byte meaning "not available".
pub const MISSING_QUALITY: u8 = 0xFF;

const REF_ID: usize = 0;
const POS: usize = 4;
const L_READ_NAME: usize = 8;
const MAPQ: usize = 9;
const BIN: usize = 10;
const N_CIGAR_OP: usize = 12;
const FLAG: usize = 14;
const L_SEQ: usize = 16;
const NEXT_REF_ID: usize = 20;
const NEXT_POS: usize = 24;
const TLEN: usize = 28;

/// Template having multiple segments in sequencing
pub const FLAG_PAIRED: u16 = 0x1;
/// Each segment properly aligned
pub const FLAG_PROPER_PAIR: u16 = 0x2;
/// Segment unmapped
pub const FLAG_UNMAPPED: u16 = 0x4;
/// Next segment unmapped
pub const FLAG_MATE_UNMAPPED: u16 = 0x8;
/// Sequence reverse complemented
pub const FLAG_REVERSE: u16 = 0x10;
/// Next segment reverse complemented
pub const FLAG_MATE_REVERSE: u16 = 0x20;
/// First segment in the template
pub const FLAG_FIRST_OF_PAIR: u16 = 0x40;
/// Last segment in the template
pub const FLAG_SECOND_OF_PAIR: u16 = 0x80;
/// Secondary alignment
pub const FLAG_SECONDARY: u16 = 0x100;
/// Not passing quality controls
pub const FLAG_QC_FAIL: u16 = 0x200;
/// PCR or optical duplicate
pub const FLAG_DUPLICATE: u16 = 0x400;
/// Supplementary alignment
pub const FLAG_SUPPLEMENTARY: u16 = 0x800;

/// Offsets of the variable-length sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    cigar: usize,
    seq: usize,
    qual: usize,
    tags: usize,
}

impl Layout {
    /// Validate `data` and locate its sections.
    fn compute(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_FIELDS_SIZE {
            return Err(BamError::CorruptBlock(format!(
                "record too short: {} bytes (minimum {})",
                data.len(),
                FIXED_FIELDS_SIZE
            )));
        }

        let l_read_name = data[L_READ_NAME] as usize;
        if l_read_name == 0 {
            return Err(BamError::CorruptBlock(
                "read name length is zero".to_string(),
            ));
        }
        let n_cigar = u16::from_le_bytes([data[N_CIGAR_OP], data[N_CIGAR_OP + 1]]) as usize;
        let l_seq = read_i32(data, L_SEQ);
        let l_seq = usize::try_from(l_seq)
            .map_err(|_| BamError::CorruptBlock(format!("negative sequence length {}", l_seq)))?;

        let cigar = FIXED_FIELDS_SIZE + l_read_name;
        let seq = cigar + n_cigar * 4;
        let qual = seq
            .checked_add(l_seq.div_ceil(2))
            .ok_or_else(|| BamError::CorruptBlock("sequence length overflows".to_string()))?;
        let tags = qual
            .checked_add(l_seq)
            .ok_or_else(|| BamError::CorruptBlock("sequence length overflows".to_string()))?;
        if tags > data.len() {
            return Err(BamError::CorruptBlock(format!(
                "record fields need {} bytes but only {} are present",
                tags,
                data.len()
            )));
        }
        if data[cigar - 1] != 0 {
            return Err(BamError::CorruptBlock(
                "read name not null-terminated".to_string(),
            ));
        }
        for field in [REF_ID, NEXT_REF_ID] {
            let id = read_i32(data, field);
            if id < -1 {
                return Err(BamError::CorruptBlock(format!("invalid reference id {}", id)));
            }
        }
        let mut span = 0u64;
        for chunk in data[cigar..seq].chunks_exact(4) {
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            match raw & 0xF {
                0 | 2 | 3 | 7 | 8 => span += (raw >> 4) as u64,
                1 | 4..=6 => {}
                code => {
                    return Err(BamError::CorruptBlock(format!(
                        "invalid CIGAR operation code {}",
                        code
                    )))
                }
            }
        }
        let position = read_i32(data, POS);
        if !span_fits(position, span) {
            return Err(BamError::CorruptBlock(format!(
                "alignment at {} spanning {} bases ends past {}",
                position, span, MAX_REFERENCE_END
            )));
        }

        Ok(Self {
            cigar,
            seq,
            qual,
            tags,
        })
    }
}

/// Whether an alignment starting at `position` can cover `span` bases.
fn span_fits(position: i32, span: u64) -> bool {
    position.max(0) as u64 + span <= MAX_REFERENCE_END as u64
}

fn read_i32(data: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// BAM alignment record backed by its binary encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    data: Vec<u8>,
    layout: Layout,
}

macro_rules! flag_accessors {
    ($($(#[$doc:meta])* $get:ident, $set:ident, $bit:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> bool {
                self.flag() & $bit != 0
            }

            #[doc = concat!("Set or clear the bit read by [`", stringify!($get), "`](Self::", stringify!($get), ").")]
            pub fn $set(&mut self, value: bool) {
                let flag = if value { self.flag() | $bit } else { self.flag() & !$bit };
                self.set_flag(flag);
            }
        )*
    };
}

macro_rules! typed_tag_getters {
    ($($(#[$doc:meta])* $name:ident -> $ty:ty, $variant:ident, $label:expr;)*) => {
        $(
            $(#[$doc])*
            ///
            /// Returns `Ok(None)` if the tag is absent and
            /// [`BamError::TypeMismatch`] if it holds another type.
            pub fn $name(&self, key: &TagKey) -> Result<Option<$ty>> {
                match self.tag(key)? {
                    None => Ok(None),
                    Some(TagValue::$variant(v)) => Ok(Some(v)),
                    Some(other) => Err(type_mismatch(key, $label, other.tag_type())),
                }
            }
        )*
    };
}

macro_rules! typed_tag_setters {
    ($($(#[$doc:meta])* $name:ident($ty:ty) => $variant:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, key: &TagKey, value: $ty) -> Result<()> {
                self.set_tag(key, TagValue::$variant(value))
            }
        )*
    };
}

fn type_mismatch(key: &TagKey, expected: &'static str, found: TagType) -> BamError {
    BamError::TypeMismatch {
        tag: String::from_utf8_lossy(key).into_owned(),
        expected,
        found: found.name(),
    }
}

impl Record {
    /// Adopt a record body (everything after `block_size`).
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] if the length fields do not fit
    /// the buffer, the name is not NUL-terminated, a reference id is below
    /// -1, or a CIGAR operation code is invalid.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let layout = Layout::compute(&data)?;
        Ok(Self { data, layout })
    }

    /// Start building a record field by field.
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// The record body as stored on disk (without `block_size`).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Give up the record body.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Size of the record body in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Never true for a valid record; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write `block_size` followed by the body.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let block_size = u32::try_from(self.data.len())
            .map_err(|_| BamError::OutOfRange("record larger than 4 GiB".to_string()))?;
        writer.write_all(&block_size.to_le_bytes())?;
        writer.write_all(&self.data)?;
        Ok(())
    }

    fn i32_at(&self, at: usize) -> i32 {
        read_i32(&self.data, at)
    }

    fn u16_at(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.data[at], self.data[at + 1]])
    }

    fn put_i32(&mut self, at: usize, value: i32) {
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u16(&mut self, at: usize, value: u16) {
        self.data[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Replace `range` with `bytes` and rebuild the offset table.
    fn splice(&mut self, range: Range<usize>, bytes: &[u8]) -> Result<()> {
        self.data.splice(range, bytes.iter().copied());
        self.layout = Layout::compute(&self.data)?;
        Ok(())
    }

    // ----- fixed fields -----

    /// Reference sequence ID (-1 if none).
    pub fn ref_id(&self) -> i32 {
        self.i32_at(REF_ID)
    }

    /// Set the reference sequence ID.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for values below -1.
    pub fn set_ref_id(&mut self, ref_id: i32) -> Result<()> {
        if ref_id < -1 {
            return Err(BamError::OutOfRange(format!("invalid reference id {}", ref_id)));
        }
        self.put_i32(REF_ID, ref_id);
        Ok(())
    }

    /// 0-based leftmost position (-1 if none).
    pub fn position(&self) -> i32 {
        self.i32_at(POS)
    }

    /// Set the position and recompute the index bin.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for values below -1, or if the
    /// alignment would then end past [`MAX_REFERENCE_END`].
    pub fn set_position(&mut self, position: i32) -> Result<()> {
        if position < -1 {
            return Err(BamError::OutOfRange(format!("invalid position {}", position)));
        }
        let span = self.reference_span();
        if !span_fits(position, span) {
            return Err(BamError::OutOfRange(format!(
                "alignment at {} spanning {} bases ends past {}",
                position, span, MAX_REFERENCE_END
            )));
        }
        self.put_i32(POS, position);
        self.update_bin();
        Ok(())
    }

    /// Mapping quality; `None` when unavailable (stored as 255).
    pub fn mapping_quality(&self) -> Option<u8> {
        match self.data[MAPQ] {
            255 => None,
            q => Some(q),
        }
    }

    /// Set the mapping quality (`None` for unavailable).
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for `Some(255)`.
    pub fn set_mapping_quality(&mut self, mapq: Option<u8>) -> Result<()> {
        self.data[MAPQ] = match mapq {
            None => 255,
            Some(255) => {
                return Err(BamError::OutOfRange(
                    "mapping quality 255 is reserved for unavailable".to_string(),
                ))
            }
            Some(q) => q,
        };
        Ok(())
    }

    /// BAI bin stored in the record.
    pub fn bin(&self) -> u16 {
        self.u16_at(BIN)
    }

    /// FLAG bitfield.
    pub fn flag(&self) -> u16 {
        self.u16_at(FLAG)
    }

    /// Overwrite the FLAG bitfield.
    pub fn set_flag(&mut self, flag: u16) {
        self.put_u16(FLAG, flag);
    }

    flag_accessors! {
        /// Read is part of a pair.
        is_paired, set_is_paired, FLAG_PAIRED;
        /// Both reads of the pair aligned as expected.
        is_proper_pair, set_is_proper_pair, FLAG_PROPER_PAIR;
        /// Read is unmapped.
        is_unmapped, set_is_unmapped, FLAG_UNMAPPED;
        /// Mate is unmapped.
        mate_is_unmapped, set_mate_is_unmapped, FLAG_MATE_UNMAPPED;
        /// Read aligned to the reverse strand.
        is_reverse_strand, set_is_reverse_strand, FLAG_REVERSE;
        /// Mate aligned to the reverse strand.
        mate_is_reverse_strand, set_mate_is_reverse_strand, FLAG_MATE_REVERSE;
        /// First read of the pair.
        is_first_of_pair, set_is_first_of_pair, FLAG_FIRST_OF_PAIR;
        /// Second read of the pair.
        is_second_of_pair, set_is_second_of_pair, FLAG_SECOND_OF_PAIR;
        /// Secondary alignment.
        is_secondary_alignment, set_is_secondary_alignment, FLAG_SECONDARY;
        /// Failed quality control.
        failed_quality_control, set_failed_quality_control, FLAG_QC_FAIL;
        /// PCR or optical duplicate.
        is_duplicate, set_is_duplicate, FLAG_DUPLICATE;
        /// Supplementary alignment.
        is_supplementary, set_is_supplementary, FLAG_SUPPLEMENTARY;
    }

    /// `'+'` or `'-'` from the reverse-strand flag.
    pub fn strand(&self) -> char {
        if self.is_reverse_strand() {
            '-'
        } else {
            '+'
        }
    }

    /// `'+'` or `'-'` from the mate-reverse-strand flag.
    pub fn mate_strand(&self) -> char {
        if self.mate_is_reverse_strand() {
            '-'
        } else {
            '+'
        }
    }

    fn strand_flag(strand: char) -> Result<bool> {
        match strand {
            '+' => Ok(false),
            '-' => Ok(true),
            other => Err(BamError::OutOfRange(format!("invalid strand {:?}", other))),
        }
    }

    /// Set the strand from `'+'` or `'-'`.
    pub fn set_strand(&mut self, strand: char) -> Result<()> {
        let reverse = Self::strand_flag(strand)?;
        self.set_is_reverse_strand(reverse);
        Ok(())
    }

    /// Set the mate strand from `'+'` or `'-'`.
    pub fn set_mate_strand(&mut self, strand: char) -> Result<()> {
        let reverse = Self::strand_flag(strand)?;
        self.set_mate_is_reverse_strand(reverse);
        Ok(())
    }

    /// Mate's reference ID.
    pub fn mate_ref_id(&self) -> i32 {
        self.i32_at(NEXT_REF_ID)
    }

    /// Set the mate's reference ID.
    pub fn set_mate_ref_id(&mut self, ref_id: i32) -> Result<()> {
        if ref_id < -1 {
            return Err(BamError::OutOfRange(format!("invalid mate reference id {}", ref_id)));
        }
        self.put_i32(NEXT_REF_ID, ref_id);
        Ok(())
    }

    /// Mate's 0-based position.
    pub fn mate_position(&self) -> i32 {
        self.i32_at(NEXT_POS)
    }

    /// Set the mate's position.
    pub fn set_mate_position(&mut self, position: i32) -> Result<()> {
        if position < -1 {
            return Err(BamError::OutOfRange(format!("invalid mate position {}", position)));
        }
        self.put_i32(NEXT_POS, position);
        Ok(())
    }

    /// Observed template length.
    pub fn template_length(&self) -> i32 {
        self.i32_at(TLEN)
    }

    /// Set the template length.
    pub fn set_template_length(&mut self, tlen: i32) {
        self.put_i32(TLEN, tlen);
    }

    /// Name of the record's reference in `references`.
    pub fn reference_name<'r>(&self, references: &'r [Reference]) -> Option<&'r str> {
        usize::try_from(self.ref_id())
            .ok()
            .and_then(|i| references.get(i))
            .map(|r| r.name.as_str())
    }

    // ----- read name -----

    /// Read name without the NUL terminator.
    pub fn name(&self) -> &[u8] {
        &self.data[FIXED_FIELDS_SIZE..self.layout.cigar - 1]
    }

    /// Replace the read name.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for an empty name, one longer than
    /// 254 bytes, or one with characters outside `!`..`~`.
    pub fn set_name(&mut self, name: &[u8]) -> Result<()> {
        if name.is_empty() || name.len() > 254 {
            return Err(BamError::OutOfRange(format!(
                "read name length {} not in 1..=254",
                name.len()
            )));
        }
        if !name.iter().all(|b| (b'!'..=b'~').contains(b)) {
            return Err(BamError::OutOfRange(
                "read name contains non-printable characters".to_string(),
            ));
        }
        let mut encoded = Vec::with_capacity(name.len() + 1);
        encoded.extend_from_slice(name);
        encoded.push(0);
        self.data[L_READ_NAME] = encoded.len() as u8;
        let range = FIXED_FIELDS_SIZE..self.layout.cigar;
        self.splice(range, &encoded)
    }

    // ----- CIGAR -----

    /// Number of CIGAR operations.
    pub fn cigar_len(&self) -> usize {
        (self.layout.seq - self.layout.cigar) / 4
    }

    fn raw_cigar(&self) -> impl Iterator<Item = u32> + '_ {
        self.data[self.layout.cigar..self.layout.seq]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Decoded CIGAR operations.
    pub fn cigar(&self) -> Result<Vec<CigarOp>> {
        parse_cigar(&self.data[self.layout.cigar..self.layout.seq], self.cigar_len())
    }

    /// Replace the CIGAR and recompute the index bin.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for more than 65535 operations, an
    /// operation longer than [`MAX_OP_LENGTH`](cigar::MAX_OP_LENGTH), or an alignment that would
    /// end past [`MAX_REFERENCE_END`]. The record is unchanged on error.
    pub fn set_cigar(&mut self, ops: &[CigarOp]) -> Result<()> {
        let n = u16::try_from(ops.len()).map_err(|_| {
            BamError::OutOfRange(format!("{} CIGAR operations exceed 65535", ops.len()))
        })?;
        let mut encoded = Vec::new();
        encode_cigar(ops, &mut encoded)?;
        let span = cigar::reference_span(ops);
        if !span_fits(self.position(), span) {
            return Err(BamError::OutOfRange(format!(
                "alignment at {} spanning {} bases ends past {}",
                self.position(),
                span,
                MAX_REFERENCE_END
            )));
        }
        self.put_u16(N_CIGAR_OP, n);
        let range = self.layout.cigar..self.layout.seq;
        self.splice(range, &encoded)?;
        self.update_bin();
        Ok(())
    }

    /// Reference bases covered by the alignment (0 without a CIGAR).
    ///
    /// A valid record never ends past [`MAX_REFERENCE_END`].
    pub fn reference_span(&self) -> u64 {
        self.raw_cigar()
            .filter(|raw| matches!(raw & 0xF, 0 | 2 | 3 | 7 | 8))
            .map(|raw| (raw >> 4) as u64)
            .sum()
    }

    /// One past the last aligned reference position.
    pub fn end_position(&self) -> i32 {
        let end = self.position() as i64 + self.reference_span() as i64;
        i32::try_from(end).unwrap_or(i32::MAX)
    }

    /// CIGAR with `M` split into `=`/`X` using the MD tag.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::TypeMismatch`] if MD is absent or not a string,
    /// and [`BamError::CorruptBlock`] if it disagrees with the CIGAR.
    pub fn extended_cigar(&self) -> Result<Vec<CigarOp>> {
        let md = self
            .string_tag(b"MD")?
            .ok_or_else(|| type_mismatch(b"MD", "string", TagType::Null))?;
        md::extended_cigar(&self.cigar()?, &md)
    }

    fn update_bin(&mut self) {
        let start = self.position();
        let span = self.reference_span().max(1) as i64;
        let bin = if start < 0 {
            reg2bin(-1, 0)
        } else {
            reg2bin(start as i64, start as i64 + span)
        };
        self.put_u16(BIN, bin);
    }

    // ----- sequence and qualities -----

    /// Number of bases.
    pub fn sequence_length(&self) -> usize {
        self.layout.tags - self.layout.qual
    }

    /// Decoded bases.
    pub fn sequence(&self) -> Vec<u8> {
        let packed = &self.data[self.layout.seq..self.layout.qual];
        (0..self.sequence_length()).map(|i| base_at(packed, i)).collect()
    }

    /// Base at query offset `i`.
    pub fn base_at(&self, i: usize) -> Option<u8> {
        (i < self.sequence_length()).then(|| base_at(&self.data[self.layout.seq..self.layout.qual], i))
    }

    /// Replace the bases. Every base quality is reset to missing (0xFF).
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for a base outside the IUPAC set.
    pub fn set_sequence(&mut self, bases: &[u8]) -> Result<()> {
        let l_seq = i32::try_from(bases.len())
            .map_err(|_| BamError::OutOfRange("sequence too long".to_string()))?;
        let mut encoded = encode_sequence(bases)?;
        encoded.resize(encoded.len() + bases.len(), MISSING_QUALITY);
        self.put_i32(L_SEQ, l_seq);
        let range = self.layout.seq..self.layout.tags;
        self.splice(range, &encoded)
    }

    /// Raw Phred base qualities (0xFF = missing).
    pub fn base_qualities(&self) -> &[u8] {
        &self.data[self.layout.qual..self.layout.tags]
    }

    /// Whether base qualities are stored (first byte is not 0xFF).
    pub fn has_base_qualities(&self) -> bool {
        self.base_qualities().first().is_some_and(|&q| q != MISSING_QUALITY)
    }

    /// Overwrite the base qualities.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] if the length differs from the
    /// sequence length.
    pub fn set_base_qualities(&mut self, qualities: &[u8]) -> Result<()> {
        if qualities.len() != self.sequence_length() {
            return Err(BamError::OutOfRange(format!(
                "{} qualities for a sequence of {} bases",
                qualities.len(),
                self.sequence_length()
            )));
        }
        let range = self.layout.qual..self.layout.tags;
        self.data[range].copy_from_slice(qualities);
        Ok(())
    }

    // ----- tags -----

    /// Raw tag block.
    pub fn tag_bytes(&self) -> &[u8] {
        &self.data[self.layout.tags..]
    }

    /// Every tag, in stored order.
    pub fn tags(&self) -> Result<Vec<(TagKey, TagValue)>> {
        tags::parse_tags(self.tag_bytes())
    }

    /// Value of `key`, `None` if absent.
    pub fn tag(&self, key: &TagKey) -> Result<Option<TagValue>> {
        let block = self.tag_bytes();
        match tags::find_entry(block, key)? {
            Some(entry) => entry.value(block).map(Some),
            None => Ok(None),
        }
    }

    /// Kind of `key`'s value; [`TagType::Null`] when absent.
    pub fn tag_type(&self, key: &TagKey) -> Result<TagType> {
        tags::entry_type(self.tag_bytes(), key)
    }

    /// Numeric type id of `key` (2 when absent).
    pub fn tag_type_id(&self, key: &TagKey) -> Result<u8> {
        self.tag_type(key).map(TagType::id)
    }

    /// Set `key` to `value`, replacing an existing value in place or
    /// appending a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for an invalid key or value.
    pub fn set_tag(&mut self, key: &TagKey, value: TagValue) -> Result<()> {
        validate_key(key)?;
        let mut encoded = Vec::with_capacity(16);
        encoded.extend_from_slice(key);
        value.encode(&mut encoded)?;

        let base = self.layout.tags;
        let range = match tags::find_entry(self.tag_bytes(), key)? {
            Some(entry) => base + entry.start..base + entry.end,
            None => self.data.len()..self.data.len(),
        };
        self.splice(range, &encoded)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove_tag(&mut self, key: &TagKey) -> Result<bool> {
        let base = self.layout.tags;
        match tags::find_entry(self.tag_bytes(), key)? {
            Some(entry) => {
                self.splice(base + entry.start..base + entry.end, &[])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    typed_tag_getters! {
        /// `A` tag value.
        char_tag -> u8, Char, "char";
        /// `c` tag value.
        int8_tag -> i8, Int8, "int8";
        /// `C` tag value.
        uint8_tag -> u8, UInt8, "uint8";
        /// `s` tag value.
        int16_tag -> i16, Int16, "int16";
        /// `S` tag value.
        uint16_tag -> u16, UInt16, "uint16";
        /// `i` tag value.
        int32_tag -> i32, Int32, "int32";
        /// `I` tag value.
        uint32_tag -> u32, UInt32, "uint32";
        /// `f` tag value.
        float_tag -> f32, Float, "float";
        /// `B:c` tag value.
        int8_array_tag -> Vec<i8>, Int8Array, "int8 array";
        /// `B:C` tag value.
        uint8_array_tag -> Vec<u8>, UInt8Array, "uint8 array";
        /// `B:s` tag value.
        int16_array_tag -> Vec<i16>, Int16Array, "int16 array";
        /// `B:S` tag value.
        uint16_array_tag -> Vec<u16>, UInt16Array, "uint16 array";
        /// `B:i` tag value.
        int32_array_tag -> Vec<i32>, Int32Array, "int32 array";
        /// `B:I` tag value.
        uint32_array_tag -> Vec<u32>, UInt32Array, "uint32 array";
        /// `B:f` tag value.
        float_array_tag -> Vec<f32>, FloatArray, "float array";
    }

    /// `Z` or `H` tag value.
    ///
    /// Returns `Ok(None)` if the tag is absent and
    /// [`BamError::TypeMismatch`] if it holds another type.
    pub fn string_tag(&self, key: &TagKey) -> Result<Option<String>> {
        match self.tag(key)? {
            None => Ok(None),
            Some(TagValue::String(s)) | Some(TagValue::Hex(s)) => Ok(Some(s)),
            Some(other) => Err(type_mismatch(key, "string", other.tag_type())),
        }
    }

    typed_tag_setters! {
        /// Set an `A` tag.
        set_char_tag(u8) => Char;
        /// Set a `c` tag.
        set_int8_tag(i8) => Int8;
        /// Set a `C` tag.
        set_uint8_tag(u8) => UInt8;
        /// Set an `s` tag.
        set_int16_tag(i16) => Int16;
        /// Set an `S` tag.
        set_uint16_tag(u16) => UInt16;
        /// Set an `i` tag.
        set_int32_tag(i32) => Int32;
        /// Set an `I` tag.
        set_uint32_tag(u32) => UInt32;
        /// Set an `f` tag.
        set_float_tag(f32) => Float;
    }

    /// Set a `Z` tag.
    pub fn set_string_tag(&mut self, key: &TagKey, value: &str) -> Result<()> {
        self.set_tag(key, TagValue::String(value.to_string()))
    }

    // ----- text -----

    /// Format the record as a SAM line (no trailing newline).
    pub fn to_sam(&self, references: &[Reference]) -> Result<String> {
        use std::fmt::Write as _;

        let rname = self.reference_name(references).unwrap_or("*");
        let rnext = match self.mate_ref_id() {
            -1 => "*",
            id if id == self.ref_id() => "=",
            id => usize::try_from(id)
                .ok()
                .and_then(|i| references.get(i))
                .map(|r| r.name.as_str())
                .unwrap_or("*"),
        };
        let seq = if self.sequence_length() == 0 {
            "*".to_string()
        } else {
            String::from_utf8_lossy(&self.sequence()).into_owned()
        };
        let qual = if self.has_base_qualities() {
            self.base_qualities()
                .iter()
                .map(|&q| (q.saturating_add(33)) as char)
                .collect()
        } else {
            "*".to_string()
        };

        let mut line = String::new();
        // Writing to a String cannot fail
        let _ = write!(
            line,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            String::from_utf8_lossy(self.name()),
            self.flag(),
            rname,
            self.position() as i64 + 1,
            self.data[MAPQ],
            format_cigar(&self.cigar()?),
            rnext,
            self.mate_position() as i64 + 1,
            self.template_length(),
            seq,
            qual
        );
        for (key, value) in self.tags()? {
            let _ = write!(line, "\t{}{}:{}", key[0] as char, key[1] as char, value);
        }
        Ok(line)
    }
}

impl Default for Record {
    fn default() -> Self {
        let data = empty_record_bytes();
        let layout = Layout {
            cigar: FIXED_FIELDS_SIZE + 2,
            seq: FIXED_FIELDS_SIZE + 2,
            qual: FIXED_FIELDS_SIZE + 2,
            tags: FIXED_FIELDS_SIZE + 2,
        };
        Self { data, layout }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &String::from_utf8_lossy(self.name()))
            .field("ref_id", &self.ref_id())
            .field("position", &self.position())
            .field("flag", &self.flag())
            .field("mapq", &self.mapping_quality())
            .field("cigar", &self.cigar().map(|c| format_cigar(&c)).ok())
            .field("sequence_length", &self.sequence_length())
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Fixed fields of an empty unmapped record named `*`.
fn empty_record_bytes() -> Vec<u8> {
    let mut data = Vec::with_capacity(FIXED_FIELDS_SIZE + 2);
    data.extend_from_slice(&(-1i32).to_le_bytes());
    data.extend_from_slice(&(-1i32).to_le_bytes());
    data.push(2);
    data.push(255);
    data.extend_from_slice(&reg2bin(-1, 0).to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&0i32.to_le_bytes());
    data.extend_from_slice(&(-1i32).to_le_bytes());
    data.extend_from_slice(&(-1i32).to_le_bytes());
    data.extend_from_slice(&0i32.to_le_bytes());
    data.extend_from_slice(b"*\0");
    data
}

/// Field-by-field constructor for [`Record`].
///
/// # Example
///
/// ```
/// use bamkit::io::bam::{parse_cigar_string, Record};
///
/// # fn main() -> bamkit::Result<()> {
/// let record = Record::builder()
///     .name(b"read1")
///     .ref_id(0)
///     .position(100)
///     .mapping_quality(Some(60))
///     .cigar(parse_cigar_string("4M")?)
///     .sequence(b"ACGT")
///     .qualities(vec![30, 30, 30, 30])
///     .build()?;
/// assert_eq!(record.end_position(), 104);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    name: Vec<u8>,
    ref_id: i32,
    position: i32,
    mapq: Option<u8>,
    flag: u16,
    cigar: Vec<CigarOp>,
    sequence: Vec<u8>,
    qualities: Option<Vec<u8>>,
    mate_ref_id: i32,
    mate_position: i32,
    template_length: i32,
    tags: Vec<(TagKey, TagValue)>,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self {
            name: b"*".to_vec(),
            ref_id: -1,
            position: -1,
            mapq: None,
            flag: 0,
            cigar: Vec::new(),
            sequence: Vec::new(),
            qualities: None,
            mate_ref_id: -1,
            mate_position: -1,
            template_length: 0,
            tags: Vec::new(),
        }
    }
}

impl RecordBuilder {
    /// Read name.
    pub fn name(mut self, name: &[u8]) -> Self {
        self.name = name.to_vec();
        self
    }

    /// Reference ID.
    pub fn ref_id(mut self, ref_id: i32) -> Self {
        self.ref_id = ref_id;
        self
    }

    /// 0-based position.
    pub fn position(mut self, position: i32) -> Self {
        self.position = position;
        self
    }

    /// Mapping quality (`None` = unavailable).
    pub fn mapping_quality(mut self, mapq: Option<u8>) -> Self {
        self.mapq = mapq;
        self
    }

    /// FLAG bitfield.
    pub fn flag(mut self, flag: u16) -> Self {
        self.flag = flag;
        self
    }

    /// CIGAR operations.
    pub fn cigar(mut self, cigar: Vec<CigarOp>) -> Self {
        self.cigar = cigar;
        self
    }

    /// Bases.
    pub fn sequence(mut self, bases: &[u8]) -> Self {
        self.sequence = bases.to_vec();
        self
    }

    /// Phred qualities (must match the sequence length).
    pub fn qualities(mut self, qualities: Vec<u8>) -> Self {
        self.qualities = Some(qualities);
        self
    }

    /// Mate reference ID and position.
    pub fn mate(mut self, ref_id: i32, position: i32) -> Self {
        self.mate_ref_id = ref_id;
        self.mate_position = position;
        self
    }

    /// Template length.
    pub fn template_length(mut self, tlen: i32) -> Self {
        self.template_length = tlen;
        self
    }

    /// Append a tag.
    pub fn tag(mut self, key: &TagKey, value: TagValue) -> Self {
        self.tags.push((*key, value));
        self
    }

    /// Validate the fields and encode the record.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for any field a setter would reject,
    /// including qualities whose length differs from the sequence.
    pub fn build(self) -> Result<Record> {
        if let Some(q) = &self.qualities {
            if q.len() != self.sequence.len() {
                return Err(BamError::OutOfRange(format!(
                    "{} qualities for a sequence of {} bases",
                    q.len(),
                    self.sequence.len()
                )));
            }
        }

        let mut record = Record::default();
        record.set_name(&self.name)?;
        record.set_ref_id(self.ref_id)?;
        record.set_mapping_quality(self.mapq)?;
        record.set_flag(self.flag);
        record.set_cigar(&self.cigar)?;
        record.set_sequence(&self.sequence)?;
        if let Some(q) = &self.qualities {
            record.set_base_qualities(q)?;
        }
        record.set_mate_ref_id(self.mate_ref_id)?;
        record.set_mate_position(self.mate_position)?;
        record.set_template_length(self.template_length);
        record.set_position(self.position)?;
        for (key, value) in self.tags {
            record.set_tag(&key, value)?;
        }
        Ok(record)
    }
}

/// Read one length-prefixed record.
///
/// Returns `Ok(None)` at a clean end of stream.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the stream ends inside a record or
/// the record is malformed.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let mut size_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match reader.read(&mut size_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(BamError::CorruptBlock(
                    "stream ends inside a record length".to_string(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let block_size = i32::from_le_bytes(size_bytes);
    let block_size = usize::try_from(block_size)
        .ok()
        .filter(|&n| (FIXED_FIELDS_SIZE..=MAX_RECORD_SIZE).contains(&n))
        .ok_or_else(|| BamError::CorruptBlock(format!("invalid record size {}", block_size)))?;

    let mut data = vec![0u8; block_size];
    reader.read_exact(&mut data)?;
    Record::from_bytes(data).map(Some)
}
