//! BAM file reader.
//!
//! [`BamReader`] validates the container and parses the header when it is
//! opened. Record access then comes in two lazy forms:
//!
//! - [`BamReader::records`]: every record, in file order.
//! - [`BamReader::fetch`]: records overlapping a region, using the
//!   coordinate index to seek near the first candidate.
//!
//! Each iterator owns its own file handle and BGZF stream, so several can
//! be alive at once and none of them borrows the reader. Decompression runs
//! on the reader's [`WorkerPool`], which may be shared with other readers
//! and writers.
//!
//! # Usage
//!
//! ```no_run
//! use bamkit::io::bam::BamReader;
//!
//! # fn main() -> bamkit::Result<()> {
//! let mut bam = BamReader::open("alignments.bam")?;
//! println!("{} references", bam.references().len());
//!
//! for record in bam.fetch("chr1", 10_000, 20_000)? {
//!     let record = record?;
//!     println!("{}", String::from_utf8_lossy(record.name()));
//! }
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use super::header::{read_header, Header, Reference};
use super::index::{is_stale, CoordinateIndex, VirtualOffset};
use super::record::{read_record, Record};
use crate::error::{BamError, Result};
use crate::io::bgzf::BgzfReader;
use crate::io::pool::WorkerPool;

type Stream = BgzfReader<BufReader<File>>;

/// When the coordinate index is loaded or built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexPolicy {
    /// On the first [`BamReader::fetch`]
    #[default]
    Lazy,
    /// While opening
    Eager,
    /// Only an existing, current index file is used; `fetch` fails otherwise
    Never,
}

/// Options for [`BamReader::open_with`].
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Worker threads for a private pool (`0` = available parallelism)
    pub threads: usize,
    /// Blocks in flight per stream (default: twice the pool size)
    pub read_ahead: Option<usize>,
    /// Shared pool; overrides `threads`
    pub pool: Option<Arc<WorkerPool>>,
    /// Index loading policy
    pub index_policy: IndexPolicy,
}

impl ReaderOptions {
    /// Set the private pool size.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the number of blocks in flight.
    pub fn read_ahead(mut self, blocks: usize) -> Self {
        self.read_ahead = Some(blocks);
        self
    }

    /// Decompress on a shared pool.
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the index policy.
    pub fn index_policy(mut self, policy: IndexPolicy) -> Self {
        self.index_policy = policy;
        self
    }
}

/// Reader over one BAM file.
#[derive(Debug)]
pub struct BamReader {
    path: PathBuf,
    header: Header,
    /// Offset of the first record
    data_offset: VirtualOffset,
    pool: Arc<WorkerPool>,
    owns_pool: bool,
    read_ahead: usize,
    index_policy: IndexPolicy,
    index: Option<CoordinateIndex>,
    closed: bool,
}

impl BamReader {
    /// Open `path` with default options.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OpenFailed`] if the file is missing, is not a
    /// BGZF-compressed BAM file, or its header is truncated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    /// Open `path` with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_failed = |e: BamError| BamError::OpenFailed {
            path: path.clone(),
            reason: e.to_string(),
        };

        let file = File::open(&path).map_err(|e| open_failed(e.into()))?;
        let (pool, owns_pool) = match options.pool {
            Some(pool) => (pool, false),
            None => (Arc::new(WorkerPool::new(options.threads)?), true),
        };
        let read_ahead = options
            .read_ahead
            .unwrap_or_else(|| pool.thread_count() * 2)
            .max(1);

        let mut stream = BgzfReader::with_read_ahead(BufReader::new(file), Arc::clone(&pool), read_ahead);
        let header = read_header(&mut stream).map_err(open_failed)?;
        let data_offset = stream.virtual_offset();

        let mut reader = Self {
            path,
            header,
            data_offset,
            pool,
            owns_pool,
            read_ahead,
            index_policy: options.index_policy,
            index: None,
            closed: false,
        };
        if reader.index_policy == IndexPolicy::Eager {
            reader.create_index(false)?;
        }
        Ok(reader)
    }

    /// Path the reader was opened with.
    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// Parsed header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Reference list in `ref_id` order.
    pub fn references(&self) -> &[Reference] {
        self.header.references()
    }

    /// The coordinate index, if loaded or built.
    pub fn index(&self) -> Option<&CoordinateIndex> {
        self.index.as_ref()
    }

    /// Pool used for decompression.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn check_open(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(BamError::ProtocolViolation {
                operation,
                state: "Closed",
            });
        }
        Ok(())
    }

    /// New stream positioned at `offset`.
    fn stream_at(&self, offset: VirtualOffset) -> Result<Stream> {
        let file = File::open(&self.path)?;
        let mut stream = BgzfReader::with_read_ahead(
            BufReader::new(file),
            Arc::clone(&self.pool),
            self.read_ahead,
        );
        stream.seek(offset)?;
        Ok(stream)
    }

    /// Every record in file order.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::ProtocolViolation`] after [`close`](Self::close).
    pub fn records(&self) -> Result<Records> {
        self.check_open("records")?;
        Ok(Records {
            stream: self.stream_at(self.data_offset)?,
            done: false,
        })
    }

    /// Records on `reference_name` overlapping `[start, end)` (0-based), in
    /// position order.
    ///
    /// Builds or loads the coordinate index first if needed.
    ///
    /// # Errors
    ///
    /// - [`BamError::UnknownReference`] if the name is not in the header.
    /// - [`BamError::OutOfRange`] if `start > end` or `start < 0`.
    /// - [`BamError::ProtocolViolation`] under [`IndexPolicy::Never`] with
    ///   no usable index file, or after [`close`](Self::close).
    pub fn fetch(&mut self, reference_name: &str, start: i64, end: i64) -> Result<Fetch> {
        self.check_open("fetch")?;
        let ref_id = self
            .header
            .reference_id(reference_name)
            .ok_or_else(|| BamError::UnknownReference(reference_name.to_string()))?;
        if start < 0 || start > end {
            return Err(BamError::OutOfRange(format!(
                "invalid region {}:{}-{}",
                reference_name, start, end
            )));
        }

        let offset = self.ensure_index()?.query_start(ref_id, start, end);
        let stream = match offset {
            Some(offset) if start < end => Some(self.stream_at(offset)?),
            _ => None,
        };
        Ok(Fetch {
            stream,
            ref_id,
            start,
            end,
        })
    }

    fn ensure_index(&mut self) -> Result<&CoordinateIndex> {
        if self.index.is_none() {
            if self.index_policy == IndexPolicy::Never {
                let loaded = self.load_existing(&CoordinateIndex::path_for(&self.path));
                if loaded.is_none() {
                    return Err(BamError::ProtocolViolation {
                        operation: "fetch",
                        state: "Unindexed",
                    });
                }
                self.index = loaded;
            } else {
                self.create_index(false)?;
            }
        }
        self.index.as_ref().ok_or(BamError::ProtocolViolation {
            operation: "fetch",
            state: "Unindexed",
        })
    }

    /// A current index file whose reference count matches the header.
    fn load_existing(&self, index_path: &Path) -> Option<CoordinateIndex> {
        match is_stale(&self.path, index_path) {
            Ok(false) => {}
            Ok(true) => {
                if index_path.exists() {
                    warn!("index {} is older than its BAM file; rebuilding", index_path.display());
                }
                return None;
            }
            Err(e) => {
                warn!("cannot check index {}: {}", index_path.display(), e);
                return None;
            }
        }
        match CoordinateIndex::load(index_path) {
            Ok(index) if index.reference_count() == self.header.reference_count() => Some(index),
            Ok(index) => {
                warn!(
                    "index {} covers {} references, header has {}; rebuilding",
                    index_path.display(),
                    index.reference_count(),
                    self.header.reference_count()
                );
                None
            }
            Err(e) => {
                warn!("cannot load index {}: {}; rebuilding", index_path.display(), e);
                None
            }
        }
    }

    /// Load or build the coordinate index and persist it as `<path>.bai`.
    ///
    /// Without `force`, an index already in memory or a current index file
    /// is reused. With `force`, the file is always scanned. A failure to
    /// write the index file is logged and the in-memory index is kept.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] if the scan hits a malformed or
    /// unsorted record.
    pub fn create_index(&mut self, force: bool) -> Result<()> {
        self.check_open("create_index")?;
        let index_path = CoordinateIndex::path_for(&self.path);
        if !force {
            if self.index.is_some() {
                return Ok(());
            }
            if let Some(index) = self.load_existing(&index_path) {
                self.index = Some(index);
                return Ok(());
            }
        }

        let mut stream = self.stream_at(self.data_offset)?;
        let index = CoordinateIndex::build(&mut stream, self.header.reference_count())?;
        match index.save(&index_path) {
            Ok(()) => info!("wrote index {}", index_path.display()),
            Err(e) => warn!("could not write index {}: {}", index_path.display(), e),
        }
        self.index = Some(index);
        Ok(())
    }

    /// Release the reader. Idempotent.
    ///
    /// A pool created by the reader is shut down; a shared pool is left
    /// running. Iterators already handed out keep their file handles but
    /// fail once they need a block from a stopped pool.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.index = None;
        if self.owns_pool {
            self.pool.shutdown()?;
        }
        Ok(())
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Every record of a file, in order.
pub struct Records {
    stream: Stream,
    done: bool,
}

impl Records {
    /// Position of the next record.
    pub fn virtual_offset(&self) -> VirtualOffset {
        self.stream.virtual_offset()
    }
}

impl Iterator for Records {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(&mut self.stream) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for Records {}

/// Records overlapping a region.
pub struct Fetch {
    stream: Option<Stream>,
    ref_id: i32,
    start: i64,
    end: i64,
}

impl Fetch {
    /// Reference the region is on.
    pub fn ref_id(&self) -> i32 {
        self.ref_id
    }
}

impl Iterator for Fetch {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let stream = self.stream.as_mut()?;
            let record = match read_record(stream) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.stream = None;
                    return None;
                }
                Err(e) => {
                    self.stream = None;
                    return Some(Err(e));
                }
            };

            let ref_id = record.ref_id();
            if ref_id < self.ref_id && ref_id >= 0 {
                continue;
            }
            let position = record.position() as i64;
            if ref_id != self.ref_id || position >= self.end {
                self.stream = None;
                return None;
            }
            let end = position + record.reference_span().max(1) as i64;
            if end <= self.start {
                continue;
            }
            return Some(Ok(record));
        }
    }
}

impl std::iter::FusedIterator for Fetch {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bam::cigar::{parse_cigar_string, query_length};
    use crate::io::bam::header::{encode_references, write_header_text, BAM_MAGIC};
    use crate::io::bgzf::BgzfWriter;
    use std::io::Write;

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(2).unwrap())
    }

    fn record(name: &str, ref_id: i32, pos: i32, cigar: &str) -> Record {
        let ops = parse_cigar_string(cigar).unwrap();
        let bases = vec![b'A'; query_length(&ops) as usize];
        Record::builder()
            .name(name.as_bytes())
            .ref_id(ref_id)
            .position(pos)
            .mapping_quality(Some(40))
            .cigar(ops)
            .sequence(&bases)
            .build()
            .unwrap()
    }

    fn write_bam(path: &Path, records: &[Record]) {
        let file = File::create(path).unwrap();
        let mut writer = BgzfWriter::new(file, pool());
        writer.write_all(BAM_MAGIC).unwrap();
        write_header_text(&mut writer, b"@HD\tVN:1.6\tSO:coordinate\n").unwrap();
        let refs = vec![Reference::new("chr1", 100_000), Reference::new("chr2", 50_000)];
        writer.write_all(&encode_references(&refs).unwrap()).unwrap();
        writer.flush_block().unwrap();
        for r in records {
            r.write_to(&mut writer).unwrap();
        }
        writer.finish().unwrap();
    }

    fn sample_records() -> Vec<Record> {
        vec![
            record("a", 0, 100, "50M"),
            record("b", 0, 120, "10M1000N10M"),
            record("c", 0, 2000, "30M"),
            record("d", 0, 40_000, "30M"),
            record("e", 1, 5, "20M"),
        ]
    }

    fn names(records: impl Iterator<Item = Result<Record>>) -> Vec<String> {
        records
            .map(|r| String::from_utf8(r.unwrap().name().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_open_and_iterate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let reader = BamReader::open(&path).unwrap();
        assert_eq!(reader.filename(), path.as_path());
        assert_eq!(reader.references().len(), 2);
        assert_eq!(reader.header().text(), b"@HD\tVN:1.6\tSO:coordinate\n");
        assert_eq!(names(reader.records().unwrap()), vec!["a", "b", "c", "d", "e"]);
        // a second pass starts from the beginning again
        assert_eq!(reader.records().unwrap().count(), 5);
    }

    #[test]
    fn test_fetch_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let mut reader = BamReader::open(&path).unwrap();
        assert_eq!(names(reader.fetch("chr1", 0, 100).unwrap()), Vec::<String>::new());
        assert_eq!(names(reader.fetch("chr1", 149, 150).unwrap()), vec!["a", "b"]);
        assert_eq!(names(reader.fetch("chr1", 500, 1140).unwrap()), vec!["b"]);
        assert_eq!(names(reader.fetch("chr1", 1000, 50_000).unwrap()), vec!["b", "c", "d"]);
        assert_eq!(names(reader.fetch("chr2", 0, 1_000_000).unwrap()), vec!["e"]);
        assert!(CoordinateIndex::path_for(&path).exists());
    }

    #[test]
    fn test_fetch_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let mut reader = BamReader::open(&path).unwrap();
        assert!(matches!(
            reader.fetch("chrX", 0, 10),
            Err(BamError::UnknownReference(name)) if name == "chrX"
        ));
        assert!(matches!(reader.fetch("chr1", 10, 5), Err(BamError::OutOfRange(_))));
    }

    #[test]
    fn test_never_policy_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let options = ReaderOptions::default().index_policy(IndexPolicy::Never);
        let mut reader = BamReader::open_with(&path, options.clone()).unwrap();
        assert!(matches!(
            reader.fetch("chr1", 0, 10),
            Err(BamError::ProtocolViolation { .. })
        ));

        BamReader::open(&path).unwrap().create_index(false).unwrap();
        let mut reader = BamReader::open_with(&path, options).unwrap();
        assert_eq!(reader.fetch("chr2", 0, 10).unwrap().count(), 1);
    }

    #[test]
    fn test_eager_policy_builds_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let reader =
            BamReader::open_with(&path, ReaderOptions::default().index_policy(IndexPolicy::Eager))
                .unwrap();
        assert!(reader.index().is_some());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let mut reader = BamReader::open(&path).unwrap();
        reader.close().unwrap();
        reader.close().unwrap();
        assert!(reader.is_closed());
        assert!(reader.pool().is_shut_down());
        assert!(matches!(
            reader.records(),
            Err(BamError::ProtocolViolation { state: "Closed", .. })
        ));
    }

    #[test]
    fn test_shared_pool_survives_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bam");
        write_bam(&path, &sample_records());

        let shared = pool();
        let options = ReaderOptions::default().pool(Arc::clone(&shared));
        let mut first = BamReader::open_with(&path, options.clone()).unwrap();
        let second = BamReader::open_with(&path, options).unwrap();
        first.close().unwrap();
        assert!(!shared.is_shut_down());
        assert_eq!(second.records().unwrap().count(), 5);
    }

    #[test]
    fn test_open_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bam");
        assert!(matches!(BamReader::open(&missing), Err(BamError::OpenFailed { .. })));

        let plain = dir.path().join("plain.bam");
        std::fs::write(&plain, b"not a bam file at all").unwrap();
        assert!(matches!(BamReader::open(&plain), Err(BamError::OpenFailed { .. })));
    }
}
