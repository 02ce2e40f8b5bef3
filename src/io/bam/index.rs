//! Coordinate index (BAI) for region queries.
//!
//! The index maps genomic positions to [`VirtualOffset`]s in the BGZF
//! stream so that a region query can seek close to its first overlapping
//! record instead of scanning the whole file.
//!
//! # Binning
//!
//! Each record is assigned the smallest bin of a six-level hierarchy that
//! contains its whole span:
//! - Level 0: bin 0 (512 Mbp)
//! - Level 1: bins 1-8 (64 Mbp each)
//! - Level 2: bins 9-72 (8 Mbp each)
//! - Level 3: bins 73-584 (1 Mbp each)
//! - Level 4: bins 585-4680 (128 Kbp each)
//! - Level 5: bins 4681-37449 (16 Kbp each)
//!
//! Every bin holds the chunks (virtual offset ranges) of its records. A
//! linear index additionally records, for each 16 Kbp window, the offset of
//! the first record overlapping it.
//!
//! # File Format
//!
//! ```text
//! magic[4]     "BAI\1"
//! n_ref[4]     Number of reference sequences (int32)
//! For each reference:
//!   n_bin[4]   Number of bins (int32)
//!   For each bin:
//!     bin[4]     Bin number (uint32)
//!     n_chunk[4] Number of chunks (int32)
//!     For each chunk:
//!       chunk_beg[8]  Virtual offset (uint64)
//!       chunk_end[8]  Virtual offset (uint64)
//!   n_intv[4]  Number of intervals (int32)
//!   For each interval:
//!     ioffset[8] Virtual offset (uint64)
//! n_no_coor[8] Unplaced reads (uint64, optional)
//! ```
//!
//! Bin 37450 is a pseudo-bin holding two "chunks" of per-reference
//! metadata: the offset range of the reference's records, and the mapped
//! and unmapped read counts.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;

use super::record::{read_record, Record};
use crate::error::{BamError, Result};
use crate::io::bgzf::BgzfReader;

pub use crate::io::bgzf::VirtualOffset;

/// BAI magic bytes.
pub const BAI_MAGIC: &[u8; 4] = b"BAI\x01";

/// File name suffix appended to the BAM path.
pub const INDEX_SUFFIX: &str = "bai";

/// Pseudo-bin carrying per-reference metadata.
pub const METADATA_BIN: u32 = 37450;

/// log2 of the linear index window (16 Kbp).
const LINEAR_SHIFT: u32 = 14;

/// Number of real bins (0..=37449).
const MAX_BIN: u32 = 37449;

/// Exclusive upper bound of the coordinates a BAI index can address.
pub const MAX_INDEXED_POSITION: i64 = 1 << 29;

/// Bin of the smallest level containing `[beg, end)` (0-based, half-open).
///
/// Regions reaching past [`MAX_INDEXED_POSITION`] get bin 0.
pub fn reg2bin(beg: i64, end: i64) -> u16 {
    let end = end - 1;
    if end >= MAX_INDEXED_POSITION {
        return 0;
    }
    let mut shift = LINEAR_SHIFT;
    let mut offset: i64 = ((1 << 15) - 1) / 7;
    while shift < 29 {
        if beg >> shift == end >> shift {
            return (offset + (beg >> shift)) as u16;
        }
        shift += 3;
        offset -= 1 << (29 - shift);
    }
    0
}

/// Every bin that may hold records overlapping `[beg, end)`.
pub fn reg2bins(beg: i64, end: i64) -> Vec<u32> {
    let beg = beg.max(0);
    let end = (end.max(beg + 1) - 1).min(MAX_INDEXED_POSITION - 1);
    let mut bins = vec![0];
    if beg > end {
        return bins;
    }
    for shift in (LINEAR_SHIFT..=26).step_by(3) {
        let offset = ((1i64 << (29 - shift)) - 1) / 7;
        let first = offset + (beg >> shift);
        let last = (offset + (end >> shift)).min(MAX_BIN as i64);
        bins.extend((first..=last).map(|b| b as u32));
    }
    bins
}

/// Contiguous range of the BGZF stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Virtual offset where the chunk starts
    pub start: VirtualOffset,
    /// Virtual offset just past the chunk
    pub end: VirtualOffset,
}

impl Chunk {
    /// Create a new chunk.
    pub fn new(start: VirtualOffset, end: VirtualOffset) -> Self {
        Self { start, end }
    }
}

/// A bin in the hierarchical binning index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    /// Bin number (0-37449)
    pub id: u32,
    /// Chunks of data in this bin
    pub chunks: Vec<Chunk>,
}

/// Contents of the metadata pseudo-bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMetadata {
    /// Offset of the first record on the reference
    pub start: VirtualOffset,
    /// Offset just past the last record on the reference
    pub end: VirtualOffset,
    /// Records without the unmapped flag
    pub mapped: u64,
    /// Placed records with the unmapped flag
    pub unmapped: u64,
}

/// Index data for one reference sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceIndex {
    /// Bins in ascending id order (metadata pseudo-bin excluded)
    pub bins: Vec<Bin>,
    /// Linear index: first offset per 16 Kbp window
    pub intervals: Vec<VirtualOffset>,
    /// Metadata pseudo-bin, if present
    pub metadata: Option<ReferenceMetadata>,
}

impl ReferenceIndex {
    /// Lower bound from the linear index for records overlapping `start`.
    fn min_offset(&self, start: i64) -> VirtualOffset {
        let window = (start.max(0) >> LINEAR_SHIFT) as usize;
        self.intervals
            .get(window)
            .or_else(|| self.intervals.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Per-reference bins and linear index for a coordinate-sorted BAM file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinateIndex {
    references: Vec<ReferenceIndex>,
    unplaced: Option<u64>,
}

impl CoordinateIndex {
    /// Location of the index for `bam_path`: the path with `.bai` appended.
    pub fn path_for<P: AsRef<Path>>(bam_path: P) -> PathBuf {
        let mut path = OsString::from(bam_path.as_ref().as_os_str());
        path.push(".");
        path.push(INDEX_SUFFIX);
        PathBuf::from(path)
    }

    /// Per-reference data in `ref_id` order.
    pub fn references(&self) -> &[ReferenceIndex] {
        &self.references
    }

    /// Number of references covered.
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// Records without a reference, if recorded.
    pub fn unplaced_count(&self) -> Option<u64> {
        self.unplaced
    }

    /// Smallest offset from which a scan sees every record on `ref_id`
    /// overlapping `[start, end)`.
    ///
    /// Returns `None` when no indexed record can overlap the region.
    pub fn query_start(&self, ref_id: i32, start: i64, end: i64) -> Option<VirtualOffset> {
        let reference = usize::try_from(ref_id).ok().and_then(|i| self.references.get(i))?;
        let min_offset = reference.min_offset(start);
        let wanted = reg2bins(start, end);

        reference
            .bins
            .iter()
            .filter(|bin| wanted.contains(&bin.id))
            .flat_map(|bin| bin.chunks.iter())
            .filter(|chunk| chunk.end > min_offset)
            .map(|chunk| chunk.start)
            .min()
    }

    /// Scan records from `reader` (positioned at the first record).
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] if a record is malformed, refers to
    /// a reference past `reference_count`, or the file is not sorted by
    /// coordinate. Returns [`BamError::OutOfRange`] if a record ends past
    /// [`MAX_INDEXED_POSITION`].
    pub fn build<R: Read>(reader: &mut BgzfReader<R>, reference_count: usize) -> Result<Self> {
        debug!("building coordinate index over {} references", reference_count);
        let mut builder = IndexBuilder::new(reference_count);
        loop {
            let start = reader.virtual_offset();
            let Some(record) = read_record(reader)? else {
                break;
            };
            let end = reader.virtual_offset();
            builder.push_record(&record, Chunk::new(start, end))?;
        }
        let index = builder.finish();
        debug!(
            "coordinate index built ({} unplaced records)",
            index.unplaced.unwrap_or(0)
        );
        Ok(index)
    }

    /// Load a BAI file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read_from(&mut reader)
    }

    /// Write a BAI file, replacing any existing one.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Decode BAI bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] for a bad magic, negative counts or
    /// truncated data.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != BAI_MAGIC {
            return Err(BamError::CorruptBlock(format!(
                "invalid BAI magic: expected {:?}, got {:?}",
                BAI_MAGIC, magic
            )));
        }

        let n_ref = read_count(reader, "reference")?;
        let mut references = Vec::with_capacity(n_ref.min(4096));
        for _ in 0..n_ref {
            references.push(read_reference_index(reader)?);
        }

        let mut trailer = Vec::with_capacity(8);
        reader.by_ref().take(8).read_to_end(&mut trailer)?;
        let unplaced = match trailer.len() {
            0 => None,
            8 => Some(u64::from_le_bytes([
                trailer[0], trailer[1], trailer[2], trailer[3], trailer[4], trailer[5],
                trailer[6], trailer[7],
            ])),
            n => {
                return Err(BamError::CorruptBlock(format!(
                    "truncated unplaced-read count ({} of 8 bytes)",
                    n
                )))
            }
        };

        Ok(Self {
            references,
            unplaced,
        })
    }

    /// Encode as BAI bytes.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(BAI_MAGIC)?;
        write_count(writer, self.references.len())?;
        for reference in &self.references {
            let n_bin = reference.bins.len() + usize::from(reference.metadata.is_some());
            write_count(writer, n_bin)?;
            for bin in &reference.bins {
                writer.write_all(&bin.id.to_le_bytes())?;
                write_count(writer, bin.chunks.len())?;
                for chunk in &bin.chunks {
                    writer.write_all(&chunk.start.raw().to_le_bytes())?;
                    writer.write_all(&chunk.end.raw().to_le_bytes())?;
                }
            }
            if let Some(meta) = &reference.metadata {
                writer.write_all(&METADATA_BIN.to_le_bytes())?;
                write_count(writer, 2)?;
                for value in [meta.start.raw(), meta.end.raw(), meta.mapped, meta.unmapped] {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            write_count(writer, reference.intervals.len())?;
            for offset in &reference.intervals {
                writer.write_all(&offset.raw().to_le_bytes())?;
            }
        }
        if let Some(unplaced) = self.unplaced {
            writer.write_all(&unplaced.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Whether the index at `index_path` is missing or older than `bam_path`.
pub fn is_stale<P: AsRef<Path>, Q: AsRef<Path>>(bam_path: P, index_path: Q) -> Result<bool> {
    let index_meta = match fs::metadata(index_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    let bam_modified = fs::metadata(bam_path)?.modified()?;
    Ok(index_meta.modified()? < bam_modified)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_count<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let count = read_u32(reader)? as i32;
    usize::try_from(count)
        .map_err(|_| BamError::CorruptBlock(format!("invalid {} count: {}", what, count)))
}

fn write_count<W: Write>(writer: &mut W, count: usize) -> Result<()> {
    let count = i32::try_from(count)
        .map_err(|_| BamError::OutOfRange(format!("index count {} too large", count)))?;
    writer.write_all(&count.to_le_bytes())?;
    Ok(())
}

fn read_reference_index<R: Read>(reader: &mut R) -> Result<ReferenceIndex> {
    let n_bin = read_count(reader, "bin")?;
    let mut bins = Vec::with_capacity(n_bin.min(4096));
    let mut metadata = None;

    for _ in 0..n_bin {
        let id = read_u32(reader)?;
        let n_chunk = read_count(reader, "chunk")?;
        let mut chunks = Vec::with_capacity(n_chunk.min(4096));
        for _ in 0..n_chunk {
            let start = VirtualOffset::from_raw(read_u64(reader)?);
            let end = VirtualOffset::from_raw(read_u64(reader)?);
            chunks.push(Chunk::new(start, end));
        }

        if id == METADATA_BIN {
            if let [range, counts] = chunks.as_slice() {
                metadata = Some(ReferenceMetadata {
                    start: range.start,
                    end: range.end,
                    mapped: counts.start.raw(),
                    unmapped: counts.end.raw(),
                });
            }
        } else {
            bins.push(Bin { id, chunks });
        }
    }
    bins.sort_by_key(|b| b.id);

    let n_intv = read_count(reader, "interval")?;
    let mut intervals = Vec::with_capacity(n_intv.min(1 << 16));
    for _ in 0..n_intv {
        intervals.push(VirtualOffset::from_raw(read_u64(reader)?));
    }

    Ok(ReferenceIndex {
        bins,
        intervals,
        metadata,
    })
}

/// Accumulates index entries from records in file order.
#[derive(Debug)]
pub struct IndexBuilder {
    references: Vec<ReferenceBuilder>,
    unplaced: u64,
    last: Option<(i32, i64)>,
}

#[derive(Debug, Default)]
struct ReferenceBuilder {
    bins: BTreeMap<u32, Vec<Chunk>>,
    intervals: Vec<Option<VirtualOffset>>,
    metadata: Option<ReferenceMetadata>,
}

impl IndexBuilder {
    /// Builder for a file with `reference_count` references.
    pub fn new(reference_count: usize) -> Self {
        Self {
            references: (0..reference_count).map(|_| ReferenceBuilder::default()).collect(),
            unplaced: 0,
            last: None,
        }
    }

    /// Add a record occupying `chunk` of the stream.
    pub fn push_record(&mut self, record: &Record, chunk: Chunk) -> Result<()> {
        let start = record.position() as i64;
        let end = start + record.reference_span().max(1) as i64;
        self.push(record.ref_id(), start, end, !record.is_unmapped(), chunk)
    }

    /// Add a record on `ref_id` spanning `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] if `ref_id` is out of range or the
    /// records are not sorted by coordinate, and [`BamError::OutOfRange`] if
    /// the record ends past [`MAX_INDEXED_POSITION`].
    pub fn push(&mut self, ref_id: i32, start: i64, end: i64, mapped: bool, chunk: Chunk) -> Result<()> {
        if ref_id < 0 {
            // Records without a reference sort after every placed record
            self.unplaced += 1;
            self.last = Some((i32::MAX, i64::MAX));
            return Ok(());
        }
        if start < 0 {
            self.unplaced += 1;
            return Ok(());
        }
        if end > MAX_INDEXED_POSITION {
            return Err(BamError::OutOfRange(format!(
                "record at {}:{}-{} lies beyond the BAI limit of {}",
                ref_id, start, end, MAX_INDEXED_POSITION
            )));
        }
        if let Some((last_ref, last_start)) = self.last {
            if (ref_id, start) < (last_ref, last_start) {
                return Err(BamError::CorruptBlock(format!(
                    "records are not coordinate-sorted: {}:{} after {}:{}",
                    ref_id, start, last_ref, last_start
                )));
            }
        }
        self.last = Some((ref_id, start));

        let reference = self.references.get_mut(ref_id as usize).ok_or_else(|| {
            BamError::CorruptBlock(format!("record refers to unknown reference {}", ref_id))
        })?;

        let chunks = reference.bins.entry(reg2bin(start, end) as u32).or_default();
        match chunks.last_mut() {
            Some(last) if last.end == chunk.start => last.end = chunk.end,
            _ => chunks.push(chunk),
        }

        let first_window = (start >> LINEAR_SHIFT) as usize;
        let last_window = ((end - 1) >> LINEAR_SHIFT) as usize;
        if reference.intervals.len() <= last_window {
            reference.intervals.resize(last_window + 1, None);
        }
        for slot in &mut reference.intervals[first_window..=last_window] {
            slot.get_or_insert(chunk.start);
        }

        let meta = reference.metadata.get_or_insert(ReferenceMetadata {
            start: chunk.start,
            end: chunk.end,
            mapped: 0,
            unmapped: 0,
        });
        meta.end = chunk.end;
        if mapped {
            meta.mapped += 1;
        } else {
            meta.unmapped += 1;
        }
        Ok(())
    }

    /// Freeze into a queryable index.
    pub fn finish(self) -> CoordinateIndex {
        let references = self
            .references
            .into_iter()
            .map(|r| {
                let first = r.intervals.iter().flatten().next().copied().unwrap_or_default();
                let mut previous = first;
                let intervals = r
                    .intervals
                    .into_iter()
                    .map(|slot| {
                        let offset = slot.unwrap_or(previous);
                        previous = offset;
                        offset
                    })
                    .collect();
                ReferenceIndex {
                    bins: r
                        .bins
                        .into_iter()
                        .map(|(id, chunks)| Bin { id, chunks })
                        .collect(),
                    intervals,
                    metadata: r.metadata,
                }
            })
            .collect();
        CoordinateIndex {
            references,
            unplaced: Some(self.unplaced),
        }
    }
}
