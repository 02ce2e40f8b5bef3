//! Pileup: per-position columns over a coordinate-sorted record stream.
//!
//! The engine keeps a window of *active* reads, the ones whose aligned span
//! covers the current reference position. For each position it:
//!
//! 1. retires reads whose span ended before the position,
//! 2. admits reads from the input that start at or before the position,
//! 3. advances every active read's CIGAR cursor to the position,
//! 4. publishes the column.
//!
//! Cursors only move forward, so the total work is proportional to the
//! summed spans of the reads rather than columns times reads.
//!
//! Unmapped reads, and reads whose CIGAR consumes no reference bases, are
//! skipped.
//!
//! # Example
//!
//! ```no_run
//! use bamkit::io::bam::{BamReader, Pileup, PileupOptions};
//!
//! # fn main() -> bamkit::Result<()> {
//! let mut reader = BamReader::open("alignments.bam")?;
//! let mut pileup = Pileup::new(reader.fetch("chr1", 0, 1000)?, PileupOptions::default());
//! while let Some(column) = pileup.next_column()? {
//!     println!("{}\t{}", column.position(), column.coverage());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use log::trace;

use super::cigar::CigarOp;
use super::md::reconstruct_reference;
use super::record::Record;
use crate::error::Result;

/// Base reported for a read with a deletion (or skip) at the column.
pub const DELETION_BASE: u8 = b'-';

/// Quality reported for a read with a deletion (or skip) at the column.
pub const DELETION_QUALITY: i16 = -1;

/// Pileup configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PileupOptions {
    /// Derive the reference base from each read's MD tag
    pub use_reference_reconstruction: bool,
    /// Omit columns no read covers
    pub skip_zero_coverage: bool,
}

impl Default for PileupOptions {
    fn default() -> Self {
        Self {
            use_reference_reconstruction: false,
            skip_zero_coverage: true,
        }
    }
}

impl PileupOptions {
    /// Enable or disable MD-based reference bases.
    pub fn use_reference_reconstruction(mut self, enabled: bool) -> Self {
        self.use_reference_reconstruction = enabled;
        self
    }

    /// Enable or disable zero-coverage columns.
    pub fn skip_zero_coverage(mut self, skip: bool) -> Self {
        self.skip_zero_coverage = skip;
        self
    }
}

/// A read as seen from one pileup column.
#[derive(Debug, Clone)]
pub struct PileupRead {
    record: Arc<Record>,
    cigar: Arc<[CigarOp]>,
    reference: Option<Arc<[u8]>>,
    end: i64,
    op_index: usize,
    /// Reference position where the current operation starts
    op_ref_start: i64,
    /// Query offset where the current operation starts
    op_query_start: usize,
    op_offset: u32,
}

impl PileupRead {
    fn new(record: Record, with_reference: bool) -> Result<Self> {
        let cigar: Arc<[CigarOp]> = record.cigar()?.into();
        let start = record.position() as i64;
        let end = start + record.reference_span() as i64;

        let reference = if with_reference {
            match record.string_tag(b"MD") {
                Ok(Some(md)) => match reconstruct_reference(&cigar, &record.sequence(), &md) {
                    Ok(bases) => Some(bases.into()),
                    Err(e) => {
                        trace!("ignoring MD of {}: {}", String::from_utf8_lossy(record.name()), e);
                        None
                    }
                },
                _ => None,
            }
        } else {
            None
        };

        Ok(Self {
            record: Arc::new(record),
            cigar,
            reference,
            end,
            op_index: 0,
            op_ref_start: start,
            op_query_start: 0,
            op_offset: 0,
        })
    }

    /// Move the cursor to reference position `position` (< `end`).
    fn advance_to(&mut self, position: i64) {
        while let Some(op) = self.cigar.get(self.op_index) {
            let len = op.length() as i64;
            if op.consumes_reference() && position < self.op_ref_start + len {
                break;
            }
            if op.consumes_reference() {
                self.op_ref_start += len;
            }
            if op.consumes_query() {
                self.op_query_start += len as usize;
            }
            self.op_index += 1;
        }
        self.op_offset = (position - self.op_ref_start) as u32;
    }

    /// The underlying record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Shared handle to the underlying record.
    pub fn record_handle(&self) -> Arc<Record> {
        Arc::clone(&self.record)
    }

    /// Reference position of the column.
    pub fn position(&self) -> i64 {
        self.op_ref_start + self.op_offset as i64
    }

    /// One past the read's last aligned position.
    pub fn end_position(&self) -> i64 {
        self.end
    }

    /// CIGAR operation covering the column.
    pub fn cigar_operation(&self) -> CigarOp {
        self.cigar[self.op_index]
    }

    /// Offset of the column within [`cigar_operation`](Self::cigar_operation).
    pub fn cigar_operation_offset(&self) -> u32 {
        self.op_offset
    }

    /// Index of the current operation in the CIGAR.
    pub fn cigar_operation_index(&self) -> usize {
        self.op_index
    }

    /// Operations before the current one.
    pub fn cigar_before(&self) -> &[CigarOp] {
        &self.cigar[..self.op_index]
    }

    /// Operations after the current one.
    pub fn cigar_after(&self) -> &[CigarOp] {
        &self.cigar[self.op_index + 1..]
    }

    /// Whether the read has a base at the column.
    pub fn consumes_query(&self) -> bool {
        self.cigar_operation().consumes_query()
    }

    /// Whether the read has a deletion at the column.
    pub fn is_deletion(&self) -> bool {
        matches!(self.cigar_operation(), CigarOp::Deletion(_))
    }

    /// Whether the column falls in a skipped region (`N`).
    pub fn is_ref_skip(&self) -> bool {
        matches!(self.cigar_operation(), CigarOp::RefSkip(_))
    }

    /// Query offset of the base at the column. For a deletion, the offset
    /// of the next aligned base.
    pub fn query_offset(&self) -> usize {
        if self.consumes_query() {
            self.op_query_start + self.op_offset as usize
        } else {
            self.op_query_start
        }
    }

    /// Base at the column, `None` on a deletion or skip.
    pub fn current_base(&self) -> Option<u8> {
        if self.consumes_query() {
            self.record.base_at(self.query_offset())
        } else {
            None
        }
    }

    /// Phred quality at the column, `None` on a deletion or skip.
    pub fn current_base_quality(&self) -> Option<u8> {
        if self.consumes_query() {
            self.record.base_qualities().get(self.query_offset()).copied()
        } else {
            None
        }
    }

    /// Reference base from the read's MD tag, if reconstruction is on and
    /// the tag is usable.
    pub fn reference_base(&self) -> Option<u8> {
        let offset = self.position() - self.record.position() as i64;
        let reference = self.reference.as_ref()?;
        usize::try_from(offset).ok().and_then(|i| reference.get(i)).copied()
    }
}

/// Reads covering one reference position.
#[derive(Debug, Clone, Default)]
pub struct PileupColumn {
    ref_id: i32,
    position: i64,
    reference_base: u8,
    reads: Vec<PileupRead>,
}

impl PileupColumn {
    /// Reference of the column.
    pub fn ref_id(&self) -> i32 {
        self.ref_id
    }

    /// 0-based position of the column.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Reference base: `N` unless a read's MD tag supplies one.
    pub fn reference_base(&self) -> u8 {
        self.reference_base
    }

    /// Reads covering the column, in admission order.
    pub fn reads(&self) -> &[PileupRead] {
        &self.reads
    }

    /// Number of reads covering the column, deletions included.
    pub fn coverage(&self) -> usize {
        self.reads.len()
    }

    /// Base of each read (`-` for deletions and skips).
    pub fn bases(&self) -> Vec<u8> {
        self.reads
            .iter()
            .map(|r| r.current_base().unwrap_or(DELETION_BASE))
            .collect()
    }

    /// Quality of each read (`-1` for deletions and skips).
    pub fn base_qualities(&self) -> Vec<i16> {
        self.reads
            .iter()
            .map(|r| r.current_base_quality().map_or(DELETION_QUALITY, i16::from))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Primed,
    Exhausted,
}

/// Streaming pileup over a coordinate-sorted record iterator.
pub struct Pileup<I> {
    input: I,
    options: PileupOptions,
    pending: Option<Record>,
    input_done: bool,
    active: Vec<PileupRead>,
    column: PileupColumn,
    ref_id: i32,
    /// Next position to publish
    position: i64,
    state: State,
}

impl<I> Pileup<I>
where
    I: Iterator<Item = Result<Record>>,
{
    /// Pile up `input`, which must be sorted by reference and position.
    pub fn new(input: I, options: PileupOptions) -> Self {
        Self {
            input,
            options,
            pending: None,
            input_done: false,
            active: Vec::new(),
            column: PileupColumn::default(),
            ref_id: -1,
            position: 0,
            state: State::NotStarted,
        }
    }

    /// Column produced by the last [`next_column`](Self::next_column).
    pub fn current(&self) -> Option<&PileupColumn> {
        (self.state == State::Primed).then_some(&self.column)
    }

    /// Number of reads in the active window.
    pub fn active_reads(&self) -> usize {
        self.active.len()
    }

    /// Advance to the next column.
    ///
    /// Returns `Ok(None)` once the input is exhausted. The column is reused
    /// by the following call; clone what must outlive it. After an error the
    /// pileup returns `Ok(None)`.
    pub fn next_column(&mut self) -> Result<Option<&PileupColumn>> {
        if self.state == State::Exhausted {
            return Ok(None);
        }
        match self.step() {
            Ok(true) => {
                self.state = State::Primed;
                Ok(Some(&self.column))
            }
            Ok(false) => {
                self.state = State::Exhausted;
                Ok(None)
            }
            Err(e) => {
                self.state = State::Exhausted;
                self.active.clear();
                self.column.reads.clear();
                Err(e)
            }
        }
    }

    /// Ensure `pending` holds the next record that can cover a column.
    fn fill_pending(&mut self) -> Result<()> {
        while self.pending.is_none() && !self.input_done {
            match self.input.next() {
                None => self.input_done = true,
                Some(record) => {
                    let record = record?;
                    let placed = !record.is_unmapped() && record.ref_id() >= 0 && record.position() >= 0;
                    if placed && record.reference_span() > 0 {
                        self.pending = Some(record);
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the column at the next position. Returns `false` at the end.
    fn step(&mut self) -> Result<bool> {
        loop {
            let position = self.position;
            self.active.retain(|read| read.end > position);

            loop {
                self.fill_pending()?;
                let admit = matches!(
                    &self.pending,
                    Some(r) if r.ref_id() == self.ref_id && (r.position() as i64) <= position
                );
                if !admit {
                    break;
                }
                if let Some(record) = self.pending.take() {
                    let read = PileupRead::new(record, self.options.use_reference_reconstruction)?;
                    if read.end > position {
                        self.active.push(read);
                    }
                }
            }

            if self.active.is_empty() {
                let Some(next) = &self.pending else {
                    return Ok(false);
                };
                let next_ref = next.ref_id();
                let next_start = next.position() as i64;
                let same_reference = next_ref == self.ref_id;
                let gap = same_reference && !self.options.skip_zero_coverage && next_start > position;
                if gap && self.state != State::NotStarted {
                    self.publish(position);
                    return Ok(true);
                }
                self.ref_id = next_ref;
                self.position = next_start;
                continue;
            }

            for read in &mut self.active {
                read.advance_to(position);
            }
            self.publish(position);
            return Ok(true);
        }
    }

    fn publish(&mut self, position: i64) {
        self.column.ref_id = self.ref_id;
        self.column.position = position;
        self.column.reads.clear();
        self.column.reads.extend(self.active.iter().cloned());
        self.column.reference_base = self
            .active
            .iter()
            .filter_map(PileupRead::reference_base)
            .find(|&b| b != b'N')
            .unwrap_or(b'N');
        self.position = position + 1;
    }
}

impl<I> Iterator for Pileup<I>
where
    I: Iterator<Item = Result<Record>>,
{
    type Item = Result<PileupColumn>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_column() {
            Ok(Some(column)) => Some(Ok(column.clone())),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<I> std::iter::FusedIterator for Pileup<I> where I: Iterator<Item = Result<Record>> {}
