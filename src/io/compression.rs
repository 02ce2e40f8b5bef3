//! BGZF block codec.
//!
//! A BGZF file is a series of gzip members ("blocks"), each holding at most
//! 64 KiB of uncompressed payload. Every block carries its own total size in
//! a gzip extra subfield, so a reader can find block boundaries without
//! inflating anything.
//!
//! # Block Structure
//!
//! ```text
//! offset  size  field
//! 0       1     ID1 = 31
//! 1       1     ID2 = 139
//! 2       1     CM = 8 (deflate)
//! 3       1     FLG = 4 (FEXTRA)
//! 4       4     MTIME = 0
//! 8       1     XFL = 0
//! 9       1     OS = 255
//! 10      2     XLEN (6 for blocks written here)
//! 12      XLEN  extra subfields; one of them is SI1='B', SI2='C', SLEN=2, BSIZE
//! ...     ...   raw deflate data
//! -8      4     CRC32 of the payload
//! -4      4     ISIZE, payload length
//! ```
//!
//! BSIZE is the total block size minus one. The stream ends with the fixed
//! 28-byte [`EOF_MARKER`], an empty block.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{BamError, Result};

/// Maximum size of a compressed block, and of its payload.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Payload size at which the writer cuts a block.
///
/// Leaves room for deflate's stored-block overhead so incompressible data
/// still fits in [`MAX_BLOCK_SIZE`].
pub const MAX_PAYLOAD_SIZE: usize = 65280;

/// Fixed header size of a block written by [`compress_block`].
pub const BLOCK_HEADER_SIZE: usize = 18;

/// CRC32 + ISIZE.
pub const BLOCK_FOOTER_SIZE: usize = 8;

/// Compression level meaning "codec default".
pub const DEFAULT_COMPRESSION_LEVEL: i32 = -1;

/// The empty block that terminates every BGZF stream.
pub const EOF_MARKER: [u8; 28] = [
    31, 139, 8, 4, 0, 0, 0, 0, 0, 255, // gzip header
    6, 0, 66, 67, 2, 0, 27, 0, // XLEN=6, BC, SLEN=2, BSIZE=27
    3, 0, // empty deflate stream
    0, 0, 0, 0, // CRC32
    0, 0, 0, 0, // ISIZE
];

const GZIP_ID1: u8 = 31;
const GZIP_ID2: u8 = 139;
const GZIP_CM_DEFLATE: u8 = 8;
const GZIP_FLG_FEXTRA: u8 = 4;

/// Gzip fixed header up to and including XLEN.
const FIXED_HEADER_SIZE: usize = 12;

/// Map a `[-1, 9]` level onto a flate2 setting.
///
/// # Errors
///
/// Returns [`BamError::OutOfRange`] for any other value.
pub fn compression_from_level(level: i32) -> Result<Compression> {
    match level {
        -1 => Ok(Compression::default()),
        0..=9 => Ok(Compression::new(level as u32)),
        _ => Err(BamError::OutOfRange(format!(
            "compression level {} not in [-1, 9]",
            level
        ))),
    }
}

fn deflate(payload: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2 + 64), compression);
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Compress one payload into a complete BGZF block.
///
/// A level-0 payload too large to be stored verbatim within 64 KiB is
/// deflated at level 1 instead.
///
/// # Errors
///
/// - [`BamError::OutOfRange`] if the payload exceeds 64 KiB, the level is
///   outside `[-1, 9]`, or the compressed block would not fit in 64 KiB
///
/// # Example
///
/// ```
/// use bamkit::io::compression::{compress_block, decompress_block};
///
/// # fn main() -> bamkit::Result<()> {
/// let block = compress_block(b"ACGTACGTACGT", 6)?;
/// assert_eq!(decompress_block(&block)?, b"ACGTACGTACGT");
/// # Ok(())
/// # }
/// ```
pub fn compress_block(payload: &[u8], level: i32) -> Result<Vec<u8>> {
    if payload.len() > MAX_BLOCK_SIZE {
        return Err(BamError::OutOfRange(format!(
            "payload of {} bytes exceeds the {} byte block limit",
            payload.len(),
            MAX_BLOCK_SIZE
        )));
    }

    let overhead = BLOCK_HEADER_SIZE + BLOCK_FOOTER_SIZE;
    let mut deflated = deflate(payload, compression_from_level(level)?)?;
    if level == 0 && deflated.len() + overhead > MAX_BLOCK_SIZE {
        deflated = deflate(payload, Compression::new(1))?;
    }

    let total_size = deflated.len() + overhead;
    if total_size > MAX_BLOCK_SIZE {
        return Err(BamError::OutOfRange(format!(
            "compressed block of {} bytes exceeds the {} byte block limit",
            total_size, MAX_BLOCK_SIZE
        )));
    }

    let mut block = Vec::with_capacity(total_size);
    block.extend_from_slice(&[GZIP_ID1, GZIP_ID2, GZIP_CM_DEFLATE, GZIP_FLG_FEXTRA]);
    block.extend_from_slice(&[0, 0, 0, 0]); // MTIME
    block.push(0); // XFL
    block.push(255); // OS
    block.extend_from_slice(&6u16.to_le_bytes());
    block.extend_from_slice(&[b'B', b'C']);
    block.extend_from_slice(&2u16.to_le_bytes());
    block.extend_from_slice(&((total_size - 1) as u16).to_le_bytes());
    block.extend_from_slice(&deflated);
    block.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    block.extend_from_slice(&(payload.len() as u32).to_le_bytes());

    Ok(block)
}

/// Parsed location of the pieces of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockLayout {
    /// Total block size (BSIZE + 1)
    size: usize,
    /// Offset of the deflate data
    data_start: usize,
}

/// Validate the gzip header in `header` (which must include the full extra
/// field) and locate the BSIZE subfield.
fn parse_layout(header: &[u8]) -> Result<BlockLayout> {
    if header.len() < FIXED_HEADER_SIZE {
        return Err(BamError::CorruptBlock(format!(
            "block header truncated: {} bytes",
            header.len()
        )));
    }
    if header[0] != GZIP_ID1 || header[1] != GZIP_ID2 {
        return Err(BamError::CorruptBlock(format!(
            "invalid gzip magic: expected [31, 139], got [{}, {}]",
            header[0], header[1]
        )));
    }
    if header[2] != GZIP_CM_DEFLATE {
        return Err(BamError::CorruptBlock(format!(
            "unsupported compression method {}",
            header[2]
        )));
    }
    if header[3] & GZIP_FLG_FEXTRA == 0 {
        return Err(BamError::CorruptBlock(
            "gzip member has no extra field; not a BGZF block".to_string(),
        ));
    }

    let xlen = u16::from_le_bytes([header[10], header[11]]) as usize;
    let extra_end = FIXED_HEADER_SIZE + xlen;
    if header.len() < extra_end {
        return Err(BamError::CorruptBlock(format!(
            "extra field of {} bytes extends past the header",
            xlen
        )));
    }

    let mut pos = FIXED_HEADER_SIZE;
    while pos + 4 <= extra_end {
        let slen = u16::from_le_bytes([header[pos + 2], header[pos + 3]]) as usize;
        if header[pos] == b'B' && header[pos + 1] == b'C' && slen == 2 {
            if pos + 6 > extra_end {
                return Err(BamError::CorruptBlock("BSIZE field incomplete".to_string()));
            }
            let size = u16::from_le_bytes([header[pos + 4], header[pos + 5]]) as usize + 1;
            if size < extra_end + BLOCK_FOOTER_SIZE {
                return Err(BamError::CorruptBlock(format!(
                    "block size {} is smaller than its own header",
                    size
                )));
            }
            return Ok(BlockLayout {
                size,
                data_start: extra_end,
            });
        }
        pos += 4 + slen;
    }

    Err(BamError::CorruptBlock(
        "gzip member has no BC subfield; not a BGZF block".to_string(),
    ))
}

/// Decompress one complete BGZF block.
///
/// The CRC32 and ISIZE trailer are verified.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the header is malformed, the
/// declared size disagrees with `block.len()`, inflation fails, or the
/// trailer does not match the inflated payload.
pub fn decompress_block(block: &[u8]) -> Result<Vec<u8>> {
    let layout = parse_layout(block)?;
    if layout.size != block.len() {
        return Err(BamError::CorruptBlock(format!(
            "block declares {} bytes but {} were supplied",
            layout.size,
            block.len()
        )));
    }

    let footer = &block[block.len() - BLOCK_FOOTER_SIZE..];
    let expected_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let expected_len = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]) as usize;
    if expected_len > MAX_BLOCK_SIZE {
        return Err(BamError::CorruptBlock(format!(
            "ISIZE {} exceeds the {} byte block limit",
            expected_len, MAX_BLOCK_SIZE
        )));
    }

    let deflated = &block[layout.data_start..block.len() - BLOCK_FOOTER_SIZE];
    let mut payload = Vec::with_capacity(expected_len);
    DeflateDecoder::new(deflated)
        .take(MAX_BLOCK_SIZE as u64 + 1)
        .read_to_end(&mut payload)
        .map_err(|e| BamError::CorruptBlock(format!("inflate failed: {}", e)))?;

    if payload.len() != expected_len {
        return Err(BamError::CorruptBlock(format!(
            "ISIZE mismatch: trailer says {}, inflated {}",
            expected_len,
            payload.len()
        )));
    }
    let crc = crc32fast::hash(&payload);
    if crc != expected_crc {
        return Err(BamError::CorruptBlock(format!(
            "CRC32 mismatch: expected {:08x}, computed {:08x}",
            expected_crc, crc
        )));
    }

    Ok(payload)
}

/// Read as many bytes as possible into `buf`, stopping only at end of input.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BamError::Io(e)),
        }
    }
    Ok(filled)
}

/// Read the next raw (still compressed) block from a stream.
///
/// Returns `Ok(None)` on a clean end of input, i.e. when no byte of a new
/// block is available.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the stream ends inside a block or
/// the block header is malformed.
pub fn read_block<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut block = vec![0u8; FIXED_HEADER_SIZE];
    let n = read_up_to(reader, &mut block)?;
    if n == 0 {
        return Ok(None);
    }
    if n < FIXED_HEADER_SIZE {
        return Err(BamError::CorruptBlock(format!(
            "stream ends inside a block header ({} of {} bytes)",
            n, FIXED_HEADER_SIZE
        )));
    }

    let xlen = u16::from_le_bytes([block[10], block[11]]) as usize;
    block.resize(FIXED_HEADER_SIZE + xlen, 0);
    if read_up_to(reader, &mut block[FIXED_HEADER_SIZE..])? < xlen {
        return Err(BamError::CorruptBlock(
            "stream ends inside a block extra field".to_string(),
        ));
    }

    let layout = parse_layout(&block)?;
    let header_len = block.len();
    block.resize(layout.size, 0);
    let wanted = layout.size - header_len;
    if read_up_to(reader, &mut block[header_len..])? < wanted {
        return Err(BamError::CorruptBlock(format!(
            "stream ends inside a block of {} bytes",
            layout.size
        )));
    }

    Ok(Some(block))
}
