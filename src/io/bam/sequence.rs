//! 4-bit BAM sequence packing.
//!
//! BAM stores sequences in 4-bit encoding (2 bases per byte) to save space.
//! Each nibble (4 bits) encodes one base using a lookup table.
//!
//! # Format
//!
//! - High nibble first, low nibble second within each byte
//! - 16 possible values (4 bases + ambiguity codes)
//! - Example: byte 0x12 -> bases at indices 1 ('A') and 2 ('C')
//! - An odd-length sequence pads the final low nibble with 0

use crate::error::{BamError, Result};

/// BAM 4-bit to ASCII base lookup table.
///
/// - 0 = '=' (match to reference)
/// - 1, 2, 4, 8 = A, C, G, T
/// - the rest are IUPAC ambiguity codes, 15 = N
const SEQ_LOOKUP: [u8; 16] = [
    b'=', b'A', b'C', b'M', // 0-3
    b'G', b'R', b'S', b'V', // 4-7
    b'T', b'W', b'Y', b'H', // 8-11
    b'K', b'D', b'B', b'N', // 12-15
];

/// 4-bit code for an ASCII base (case-insensitive).
///
/// # Errors
///
/// Returns [`BamError::OutOfRange`] for a character outside `=ACMGRSVTWYHKDBN`.
pub fn base_to_code(base: u8) -> Result<u8> {
    let upper = base.to_ascii_uppercase();
    SEQ_LOOKUP
        .iter()
        .position(|&b| b == upper)
        .map(|code| code as u8)
        .ok_or_else(|| BamError::OutOfRange(format!("invalid base {:?}", base as char)))
}

/// ASCII base for a 4-bit code (only the low nibble is used).
pub fn code_to_base(code: u8) -> u8 {
    SEQ_LOOKUP[(code & 0x0F) as usize]
}

/// Decode a 4-bit encoded BAM sequence to ASCII.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if `data` is too short for `length`.
///
/// # Example
///
/// ```
/// use bamkit::io::bam::decode_sequence;
///
/// // Byte 0x12 encodes bases at indices 1 ('A') and 2 ('C')
/// let sequence = decode_sequence(&[0x12], 2).unwrap();
/// assert_eq!(sequence, b"AC");
/// ```
pub fn decode_sequence(data: &[u8], length: usize) -> Result<Vec<u8>> {
    let required_bytes = length.div_ceil(2);
    if data.len() < required_bytes {
        return Err(BamError::CorruptBlock(format!(
            "insufficient sequence data: need {} bytes for {} bases, got {}",
            required_bytes,
            length,
            data.len()
        )));
    }

    Ok((0..length).map(|i| base_at(data, i)).collect())
}

/// Base at index `i` of packed data (caller guarantees bounds).
#[inline]
pub fn base_at(data: &[u8], i: usize) -> u8 {
    let byte = data[i / 2];
    let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
    SEQ_LOOKUP[nibble as usize]
}

/// Pack ASCII bases into 4-bit form.
///
/// # Errors
///
/// Returns [`BamError::OutOfRange`] if any base is not a valid IUPAC code.
pub fn encode_sequence(bases: &[u8]) -> Result<Vec<u8>> {
    let mut encoded = Vec::with_capacity(bases.len().div_ceil(2));
    for chunk in bases.chunks(2) {
        let high = base_to_code(chunk[0])?;
        let low = match chunk.get(1) {
            Some(&b) => base_to_code(b)?,
            None => 0,
        };
        encoded.push((high << 4) | low);
    }
    Ok(encoded)
}
