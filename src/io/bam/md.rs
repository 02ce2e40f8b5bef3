//! MD tag interpretation.
//!
//! The MD tag spells out the reference bases a read disagrees with:
//! `[0-9]+(([A-Z]|\^[A-Z]+)[0-9]+)*`. Numbers are runs of matching bases,
//! single letters are mismatched reference bases and `^`-prefixed letters
//! are bases deleted from the read. Together with the CIGAR and the read
//! sequence this is enough to rebuild the reference over the aligned span,
//! which the pileup uses for its reference base and
//! [`extended_cigar`] uses to split `M` into `=`/`X`.

use std::collections::VecDeque;

use super::cigar::CigarOp;
use crate::error::{BamError, Result};

/// One element of a parsed MD string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdOp {
    /// Run of bases equal to the reference
    Match(u32),
    /// Reference base at a mismatch
    Mismatch(u8),
    /// Reference bases deleted from the read
    Deletion(Vec<u8>),
}

fn inconsistent(detail: &str) -> BamError {
    BamError::CorruptBlock(format!("MD tag inconsistent with CIGAR: {}", detail))
}

/// Parse an MD string.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] for characters outside the grammar,
/// an empty deletion, or a run length that overflows.
pub fn parse_md(md: &str) -> Result<Vec<MdOp>> {
    let bytes = md.as_bytes();
    let mut ops = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_digit() {
            let mut run: u32 = 0;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                run = run
                    .checked_mul(10)
                    .and_then(|r| r.checked_add((bytes[i] - b'0') as u32))
                    .ok_or_else(|| BamError::CorruptBlock(format!("MD run too long in {:?}", md)))?;
                i += 1;
            }
            ops.push(MdOp::Match(run));
        } else if b == b'^' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                i += 1;
            }
            if i == start {
                return Err(BamError::CorruptBlock(format!("empty MD deletion in {:?}", md)));
            }
            ops.push(MdOp::Deletion(bytes[start..i].to_ascii_uppercase()));
        } else if b.is_ascii_alphabetic() {
            ops.push(MdOp::Mismatch(b.to_ascii_uppercase()));
            i += 1;
        } else {
            return Err(BamError::CorruptBlock(format!(
                "invalid character {:?} in MD tag",
                b as char
            )));
        }
    }
    Ok(ops)
}

/// What the MD string says about one aligned reference position.
enum Aligned {
    Same,
    Different(u8),
}

/// Walks MD operations one reference base at a time.
struct MdCursor {
    ops: VecDeque<MdOp>,
    /// Bases already taken from the front deletion
    deleted: usize,
}

impl MdCursor {
    fn new(md: &str) -> Result<Self> {
        Ok(Self {
            ops: parse_md(md)?.into(),
            deleted: 0,
        })
    }

    fn skip_empty_runs(&mut self) {
        while matches!(self.ops.front(), Some(MdOp::Match(0))) {
            self.ops.pop_front();
        }
    }

    /// Consume one base of an M/=/X operation.
    fn next_aligned(&mut self) -> Result<Aligned> {
        self.skip_empty_runs();
        match self.ops.front_mut() {
            Some(MdOp::Match(run)) => {
                *run -= 1;
                Ok(Aligned::Same)
            }
            Some(MdOp::Mismatch(base)) => {
                let base = *base;
                self.ops.pop_front();
                Ok(Aligned::Different(base))
            }
            Some(MdOp::Deletion(_)) => Err(inconsistent("deletion where an aligned base was expected")),
            None => Err(inconsistent("MD shorter than aligned span")),
        }
    }

    /// Consume one base of a D operation.
    fn next_deleted(&mut self) -> Result<u8> {
        self.skip_empty_runs();
        match self.ops.front() {
            Some(MdOp::Deletion(bases)) if self.deleted < bases.len() => {
                let base = bases[self.deleted];
                self.deleted += 1;
                if self.deleted == bases.len() {
                    self.ops.pop_front();
                    self.deleted = 0;
                }
                Ok(base)
            }
            _ => Err(inconsistent("missing deleted bases")),
        }
    }
}

/// Rebuild the reference over a record's aligned span.
///
/// The result has one byte per reference position covered by the CIGAR.
/// Positions inside `N` operations, or matches against a missing read
/// sequence, come back as `N`.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the MD string does not agree with
/// the CIGAR.
pub fn reconstruct_reference(cigar: &[CigarOp], sequence: &[u8], md: &str) -> Result<Vec<u8>> {
    let mut cursor = MdCursor::new(md)?;
    let mut reference = Vec::new();
    let mut query = 0usize;

    for op in cigar {
        let len = op.length() as usize;
        match op {
            CigarOp::Match(_) | CigarOp::SeqMatch(_) | CigarOp::SeqMismatch(_) => {
                for _ in 0..len {
                    let base = match cursor.next_aligned()? {
                        Aligned::Same => sequence.get(query).copied().unwrap_or(b'N'),
                        Aligned::Different(base) => base,
                    };
                    reference.push(base);
                    query += 1;
                }
            }
            CigarOp::Deletion(_) => {
                for _ in 0..len {
                    reference.push(cursor.next_deleted()?);
                }
            }
            CigarOp::RefSkip(_) => reference.extend(std::iter::repeat(b'N').take(len)),
            CigarOp::Insertion(_) | CigarOp::SoftClip(_) => query += len,
            CigarOp::HardClip(_) | CigarOp::Padding(_) => {}
        }
    }
    Ok(reference)
}

/// Rewrite `M` operations as `=`/`X` runs using the MD string.
///
/// Other operations are kept as they are.
///
/// # Errors
///
/// Returns [`BamError::CorruptBlock`] if the MD string does not agree with
/// the CIGAR.
pub fn extended_cigar(cigar: &[CigarOp], md: &str) -> Result<Vec<CigarOp>> {
    fn push(out: &mut Vec<CigarOp>, op: CigarOp) {
        if let Some(last) = out.last_mut() {
            if last.code() == op.code() && matches!(op, CigarOp::SeqMatch(_) | CigarOp::SeqMismatch(_)) {
                *last = last.with_length(last.length() + op.length());
                return;
            }
        }
        out.push(op);
    }

    let mut cursor = MdCursor::new(md)?;
    let mut out = Vec::with_capacity(cigar.len());
    for op in cigar {
        match op {
            CigarOp::Match(len) | CigarOp::SeqMatch(len) | CigarOp::SeqMismatch(len) => {
                for _ in 0..*len {
                    match cursor.next_aligned()? {
                        Aligned::Same => push(&mut out, CigarOp::SeqMatch(1)),
                        Aligned::Different(_) => push(&mut out, CigarOp::SeqMismatch(1)),
                    }
                }
            }
            CigarOp::Deletion(len) => {
                for _ in 0..*len {
                    cursor.next_deleted()?;
                }
                out.push(*op);
            }
            other => out.push(*other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bam::cigar::parse_cigar_string;

    #[test]
    fn test_parse_md() {
        assert_eq!(
            parse_md("3A0^GT5").unwrap(),
            vec![
                MdOp::Match(3),
                MdOp::Mismatch(b'A'),
                MdOp::Match(0),
                MdOp::Deletion(b"GT".to_vec()),
                MdOp::Match(5),
            ]
        );
        assert!(parse_md("3^").is_err());
        assert!(parse_md("3*2").is_err());
    }

    #[test]
    fn test_reconstruct_with_mismatch_and_deletion() {
        // read   ACGTT--ACG
        // ref    ACCTTGAACG
        let cigar = parse_cigar_string("5M2D3M").unwrap();
        let reference = reconstruct_reference(&cigar, b"ACGTTACG", "2C2^GA3").unwrap();
        assert_eq!(reference, b"ACCTTGAACG");
    }

    #[test]
    fn test_reconstruct_long_deletion() {
        let deleted: Vec<u8> = (0..200_000).map(|i| b"ACGT"[i % 4]).collect();
        let md = format!("2^{}2", String::from_utf8(deleted.clone()).unwrap());
        let cigar = vec![CigarOp::Match(2), CigarOp::Deletion(200_000), CigarOp::Match(2)];
        let reference = reconstruct_reference(&cigar, b"TTGG", &md).unwrap();
        assert_eq!(reference.len(), 200_004);
        assert_eq!(&reference[..2], b"TT");
        assert_eq!(&reference[2..200_002], &deleted[..]);
        assert_eq!(&reference[200_002..], b"GG");

        // One MD deletion may back two adjacent D operations
        let cigar = parse_cigar_string("1M1D2D1M").unwrap();
        assert_eq!(reconstruct_reference(&cigar, b"AC", "1^GTA1").unwrap(), b"AGTAC");
    }

    #[test]
    fn test_reconstruct_skips_insertions_and_clips() {
        let cigar = parse_cigar_string("2S3M1I2M").unwrap();
        // query: NN ACG T CA -> aligned ACG CA
        let reference = reconstruct_reference(&cigar, b"NNACGTCA", "1T3").unwrap();
        assert_eq!(reference, b"ATGCA");
    }

    #[test]
    fn test_reconstruct_ref_skip_unknown() {
        let cigar = parse_cigar_string("2M3N2M").unwrap();
        let reference = reconstruct_reference(&cigar, b"ACGT", "4").unwrap();
        assert_eq!(reference, b"ACNNNGT");
    }

    #[test]
    fn test_reconstruct_inconsistent_md() {
        let cigar = parse_cigar_string("5M").unwrap();
        assert!(matches!(
            reconstruct_reference(&cigar, b"ACGTA", "3"),
            Err(BamError::CorruptBlock(_))
        ));
        let cigar = parse_cigar_string("2M1D2M").unwrap();
        assert!(reconstruct_reference(&cigar, b"ACGT", "4").is_err());
    }

    #[test]
    fn test_extended_cigar() {
        let cigar = parse_cigar_string("3S5M2D3M").unwrap();
        let extended = extended_cigar(&cigar, "2C2^GA0T2").unwrap();
        assert_eq!(
            extended,
            parse_cigar_string("3S2=1X2=2D1X2=").unwrap()
        );
    }
}
