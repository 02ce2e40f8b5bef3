//! CIGAR (Compact Idiosyncratic Gapped Alignment Report) operations.
//!
//! CIGAR strings describe how a read aligns to the reference, including
//! matches, insertions, deletions, and other operations.
//!
//! # BAM Format
//!
//! In BAM, CIGAR is stored as 32-bit integers:
//! - Low 4 bits: operation type (0-8, in the order `MIDNSHP=X`)
//! - High 28 bits: operation length (0 to 268,435,455)
//!
//! # Consumption Table
//!
//! | op | reference | query |
//! |----|-----------|-------|
//! | M, =, X | yes | yes |
//! | D, N | yes | no |
//! | I, S | no | yes |
//! | H, P | no | no |

use std::fmt;

use crate::error::{BamError, Result};

/// Largest length that fits in the 28 high bits.
pub const MAX_OP_LENGTH: u32 = (1 << 28) - 1;

const OP_CHARS: [char; 9] = ['M', 'I', 'D', 'N', 'S', 'H', 'P', '=', 'X'];

/// CIGAR operation types.
///
/// Each operation describes a type of alignment event and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CigarOp {
    /// Match or mismatch (M)
    Match(u32),
    /// Insertion to reference (I)
    Insertion(u32),
    /// Deletion from reference (D)
    Deletion(u32),
    /// Skipped region from reference (N)
    RefSkip(u32),
    /// Soft clipping (S)
    SoftClip(u32),
    /// Hard clipping (H)
    HardClip(u32),
    /// Padding (P)
    Padding(u32),
    /// Sequence match (=)
    SeqMatch(u32),
    /// Sequence mismatch (X)
    SeqMismatch(u32),
}

impl CigarOp {
    /// Build an operation from its SAM letter and length.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for a letter outside `MIDNSHP=X` or a
    /// length above [`MAX_OP_LENGTH`].
    pub fn from_char(op: char, length: u32) -> Result<Self> {
        match OP_CHARS.iter().position(|&c| c == op) {
            Some(code) => Self::from_code(code as u32, length),
            None => Err(BamError::OutOfRange(format!("invalid CIGAR operation '{}'", op))),
        }
    }

    /// Build an operation from its numeric code (0-8) and length.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for a code above 8 or a length above
    /// [`MAX_OP_LENGTH`].
    pub fn from_code(code: u32, length: u32) -> Result<Self> {
        if length > MAX_OP_LENGTH {
            return Err(BamError::OutOfRange(format!(
                "CIGAR operation length {} exceeds {}",
                length, MAX_OP_LENGTH
            )));
        }
        let op = match code {
            0 => CigarOp::Match(length),
            1 => CigarOp::Insertion(length),
            2 => CigarOp::Deletion(length),
            3 => CigarOp::RefSkip(length),
            4 => CigarOp::SoftClip(length),
            5 => CigarOp::HardClip(length),
            6 => CigarOp::Padding(length),
            7 => CigarOp::SeqMatch(length),
            8 => CigarOp::SeqMismatch(length),
            other => {
                return Err(BamError::OutOfRange(format!(
                    "invalid CIGAR operation code {}",
                    other
                )))
            }
        };
        Ok(op)
    }

    /// Decode a packed `length << 4 | code` value.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::from_code(raw & 0xF, raw >> 4)
    }

    /// Pack into the BAM `length << 4 | code` form.
    pub fn to_raw(&self) -> u32 {
        (self.length() << 4) | self.code()
    }

    /// Numeric operation code (0-8).
    pub fn code(&self) -> u32 {
        match self {
            CigarOp::Match(_) => 0,
            CigarOp::Insertion(_) => 1,
            CigarOp::Deletion(_) => 2,
            CigarOp::RefSkip(_) => 3,
            CigarOp::SoftClip(_) => 4,
            CigarOp::HardClip(_) => 5,
            CigarOp::Padding(_) => 6,
            CigarOp::SeqMatch(_) => 7,
            CigarOp::SeqMismatch(_) => 8,
        }
    }

    /// Get the operation count/length.
    pub fn length(&self) -> u32 {
        match self {
            CigarOp::Match(len)
            | CigarOp::Insertion(len)
            | CigarOp::Deletion(len)
            | CigarOp::RefSkip(len)
            | CigarOp::SoftClip(len)
            | CigarOp::HardClip(len)
            | CigarOp::Padding(len)
            | CigarOp::SeqMatch(len)
            | CigarOp::SeqMismatch(len) => *len,
        }
    }

    /// Same kind of operation with a different length.
    pub fn with_length(&self, length: u32) -> Self {
        match self {
            CigarOp::Match(_) => CigarOp::Match(length),
            CigarOp::Insertion(_) => CigarOp::Insertion(length),
            CigarOp::Deletion(_) => CigarOp::Deletion(length),
            CigarOp::RefSkip(_) => CigarOp::RefSkip(length),
            CigarOp::SoftClip(_) => CigarOp::SoftClip(length),
            CigarOp::HardClip(_) => CigarOp::HardClip(length),
            CigarOp::Padding(_) => CigarOp::Padding(length),
            CigarOp::SeqMatch(_) => CigarOp::SeqMatch(length),
            CigarOp::SeqMismatch(_) => CigarOp::SeqMismatch(length),
        }
    }

    /// Check if this operation has zero length.
    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Get the operation type as a character (for SAM format).
    pub fn as_char(&self) -> char {
        OP_CHARS[self.code() as usize]
    }

    /// M, =, X, D and N advance along the reference.
    pub fn consumes_reference(&self) -> bool {
        matches!(
            self,
            CigarOp::Match(_)
                | CigarOp::Deletion(_)
                | CigarOp::RefSkip(_)
                | CigarOp::SeqMatch(_)
                | CigarOp::SeqMismatch(_)
        )
    }

    /// M, =, X, I and S advance along the read.
    pub fn consumes_query(&self) -> bool {
        matches!(
            self,
            CigarOp::Match(_)
                | CigarOp::Insertion(_)
                | CigarOp::SoftClip(_)
                | CigarOp::SeqMatch(_)
                | CigarOp::SeqMismatch(_)
        )
    }

    /// M, = and X advance along both.
    pub fn consumes_both(&self) -> bool {
        self.consumes_reference() && self.consumes_query()
    }
}

impl fmt::Display for CigarOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.length(), self.as_char())
    }
}

/// Parse BAM CIGAR operations from binary format.
///
/// # Arguments
///
/// * `data` - Raw CIGAR data (4 bytes per operation)
/// * `n_ops` - Number of CIGAR operations
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the data is too short or holds an
/// operation code above 8.
///
/// # Example
///
/// ```
/// use bamkit::io::bam::{parse_cigar, CigarOp};
///
/// // 100M = 100 << 4 | 0 = 1600 = 0x00000640 (little-endian)
/// let data = vec![0x40, 0x06, 0x00, 0x00];
/// let cigar = parse_cigar(&data, 1).unwrap();
/// assert_eq!(cigar, vec![CigarOp::Match(100)]);
/// ```
pub fn parse_cigar(data: &[u8], n_ops: usize) -> Result<Vec<CigarOp>> {
    let required = n_ops * 4;
    if data.len() < required {
        return Err(BamError::CorruptBlock(format!(
            "insufficient CIGAR data: need {} bytes for {} operations, got {}",
            required,
            n_ops,
            data.len()
        )));
    }

    data[..required]
        .chunks_exact(4)
        .map(|chunk| {
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            CigarOp::from_code(raw & 0xF, raw >> 4).map_err(|_| {
                BamError::CorruptBlock(format!("invalid CIGAR operation code {}", raw & 0xF))
            })
        })
        .collect()
}

/// Append the packed form of `ops` to `out`.
///
/// # Errors
///
/// Returns [`BamError::OutOfRange`] if an operation is longer than
/// [`MAX_OP_LENGTH`]; nothing is appended in that case.
pub fn encode_cigar(ops: &[CigarOp], out: &mut Vec<u8>) -> Result<()> {
    if let Some(op) = ops.iter().find(|op| op.length() > MAX_OP_LENGTH) {
        return Err(BamError::OutOfRange(format!(
            "CIGAR operation length {} exceeds {}",
            op.length(),
            MAX_OP_LENGTH
        )));
    }
    out.reserve(ops.len() * 4);
    for op in ops {
        out.extend_from_slice(&op.to_raw().to_le_bytes());
    }
    Ok(())
}

/// Parse SAM CIGAR text such as `"10M2I5M"`. `"*"` and `""` mean no
/// operations.
///
/// # Errors
///
/// Returns [`BamError::OutOfRange`] for an unknown letter, a missing
/// length, or a length that does not fit.
pub fn parse_cigar_string(text: &str) -> Result<Vec<CigarOp>> {
    if text.is_empty() || text == "*" {
        return Ok(Vec::new());
    }

    let mut ops = Vec::new();
    let mut length: Option<u64> = None;
    for c in text.chars() {
        if let Some(d) = c.to_digit(10) {
            let next = length.unwrap_or(0) * 10 + d as u64;
            if next > MAX_OP_LENGTH as u64 {
                return Err(BamError::OutOfRange(format!("CIGAR length too large in {:?}", text)));
            }
            length = Some(next);
        } else {
            let len = length.take().ok_or_else(|| {
                BamError::OutOfRange(format!("CIGAR operation '{}' has no length in {:?}", c, text))
            })?;
            ops.push(CigarOp::from_char(c, len as u32)?);
        }
    }
    if length.is_some() {
        return Err(BamError::OutOfRange(format!(
            "CIGAR {:?} ends with a dangling length",
            text
        )));
    }
    Ok(ops)
}

/// SAM text for a CIGAR (`"*"` when empty).
pub fn format_cigar(ops: &[CigarOp]) -> String {
    if ops.is_empty() {
        return "*".to_string();
    }
    ops.iter().map(|op| op.to_string()).collect()
}

/// Number of reference bases covered.
pub fn reference_span(ops: &[CigarOp]) -> u64 {
    ops.iter()
        .filter(|op| op.consumes_reference())
        .map(|op| op.length() as u64)
        .sum()
}

/// Number of read bases the CIGAR accounts for.
pub fn query_length(ops: &[CigarOp]) -> u64 {
    ops.iter()
        .filter(|op| op.consumes_query())
        .map(|op| op.length() as u64)
        .sum()
}
