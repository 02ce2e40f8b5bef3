//! BAM file writer.
//!
//! [`BamWriter`] enforces the order in which a BAM file is assembled:
//!
//! ```text
//! Created --push_header--> HeaderWritten --push_ref_info--> RefsWritten
//!     --push_read--> Writing --close--> Closed
//! ```
//!
//! A call made in the wrong state fails with
//! [`BamError::ProtocolViolation`] before anything is written, so a
//! misordered program cannot produce a malformed file. The magic bytes are
//! written when the writer is created; compression runs on a
//! [`WorkerPool`].
//!
//! # Example
//!
//! ```no_run
//! use bamkit::io::bam::{BamWriter, Header, Record, Reference};
//!
//! # fn main() -> bamkit::Result<()> {
//! let header = Header::new(
//!     "@HD\tVN:1.6\tSO:coordinate\n",
//!     vec![Reference::new("chr1", 248_956_422)],
//! );
//!
//! let mut writer = BamWriter::create("output.bam")?;
//! writer.write_header(&header)?;
//!
//! let record = Record::builder()
//!     .name(b"read1")
//!     .ref_id(0)
//!     .position(1000)
//!     .sequence(b"ACGT")
//!     .build()?;
//! writer.push_read(&record)?;
//!
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use super::header::{encode_references, write_header_text, Header, Reference, BAM_MAGIC};
use super::record::Record;
use crate::error::{BamError, Result};
use crate::io::bgzf::BgzfWriter;
use crate::io::compression::{compression_from_level, DEFAULT_COMPRESSION_LEVEL};
use crate::io::pool::WorkerPool;

/// Where a [`BamWriter`] is in the file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Magic written, header text expected
    Created,
    /// Header text written, references expected
    HeaderWritten,
    /// References written, no records yet
    RefsWritten,
    /// At least one record written
    Writing,
    /// Stream finished
    Closed,
}

impl WriterState {
    /// State name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            WriterState::Created => "Created",
            WriterState::HeaderWritten => "HeaderWritten",
            WriterState::RefsWritten => "RefsWritten",
            WriterState::Writing => "Writing",
            WriterState::Closed => "Closed",
        }
    }
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options for [`BamWriter::create_with`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Compression level, -1 (default) or 0-9
    pub level: i32,
    /// Worker threads for a private pool (`0` = available parallelism)
    pub threads: usize,
    /// Shared pool; overrides `threads`
    pub pool: Option<Arc<WorkerPool>>,
    /// Blocks in flight (default: twice the pool size)
    pub queue_depth: Option<usize>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
            threads: 0,
            pool: None,
            queue_depth: None,
        }
    }
}

impl WriterOptions {
    /// Set the compression level.
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Set the private pool size.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Compress on a shared pool.
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the number of blocks in flight.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }
}

/// Writer producing one BAM file.
pub struct BamWriter {
    path: PathBuf,
    stream: BgzfWriter<BufWriter<File>>,
    pool: Arc<WorkerPool>,
    owns_pool: bool,
    state: WriterState,
    records_written: u64,
}

impl BamWriter {
    /// Create `path` with default options.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, WriterOptions::default())
    }

    /// Create `path` and write the BAM magic.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::OutOfRange`] for a level outside -1..=9 and
    /// [`BamError::Io`] if the file cannot be created.
    pub fn create_with<P: AsRef<Path>>(path: P, options: WriterOptions) -> Result<Self> {
        compression_from_level(options.level)?;
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        let (pool, owns_pool) = match options.pool {
            Some(pool) => (pool, false),
            None => (Arc::new(WorkerPool::new(options.threads)?), true),
        };
        let depth = options
            .queue_depth
            .unwrap_or_else(|| pool.thread_count() * 2)
            .max(1);

        let mut stream =
            BgzfWriter::with_options(BufWriter::new(file), Arc::clone(&pool), options.level, depth);
        stream.write_bytes(BAM_MAGIC)?;
        debug!("created BAM writer for {} (level {})", path.display(), options.level);

        Ok(Self {
            path,
            stream,
            pool,
            owns_pool,
            state: WriterState::Created,
            records_written: 0,
        })
    }

    /// Current state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Worker pool compressing this file's blocks.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Path being written.
    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// Records accepted so far.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    fn expect_state(&self, operation: &'static str, allowed: &[WriterState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BamError::ProtocolViolation {
                operation,
                state: self.state.name(),
            })
        }
    }

    /// Write the SAM header text of `header`.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::ProtocolViolation`] unless the writer is in
    /// [`WriterState::Created`].
    pub fn push_header(&mut self, header: &Header) -> Result<()> {
        self.expect_state("push_header", &[WriterState::Created])?;
        write_header_text(&mut self.stream, header.text())?;
        self.state = WriterState::HeaderWritten;
        Ok(())
    }

    /// Write the reference dictionary.
    ///
    /// The block is ended afterwards so that the first record starts a new
    /// BGZF block.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::ProtocolViolation`] unless the writer is in
    /// [`WriterState::HeaderWritten`], and [`BamError::OutOfRange`] for an
    /// invalid reference.
    pub fn push_ref_info(&mut self, references: &[Reference]) -> Result<()> {
        self.expect_state("push_ref_info", &[WriterState::HeaderWritten])?;
        let encoded = encode_references(references)?;
        self.stream.write_bytes(&encoded)?;
        self.stream.flush_block()?;
        self.state = WriterState::RefsWritten;
        Ok(())
    }

    /// Write the header text and its references in one call.
    pub fn write_header(&mut self, header: &Header) -> Result<()> {
        self.push_header(header)?;
        self.push_ref_info(header.references())
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::ProtocolViolation`] before the references are
    /// written or after [`close`](Self::close).
    pub fn push_read(&mut self, record: &Record) -> Result<()> {
        self.expect_state("push_read", &[WriterState::RefsWritten, WriterState::Writing])?;
        record.write_to(&mut self.stream)?;
        self.state = WriterState::Writing;
        self.records_written += 1;
        Ok(())
    }

    /// End the current block early and push every pending block to disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Err(BamError::ProtocolViolation {
                operation: "flush",
                state: self.state.name(),
            });
        }
        self.stream.flush_block()
    }

    /// Write the final block and the EOF marker. Idempotent.
    ///
    /// A pool created by the writer is shut down, also when finishing the
    /// stream fails; a shared pool is left running.
    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        self.state = WriterState::Closed;
        let finished = self.stream.finish();
        let stopped = if self.owns_pool {
            self.pool.shutdown()
        } else {
            Ok(())
        };
        finished.and(stopped)?;
        debug!(
            "closed {} after {} records",
            self.path.display(),
            self.records_written
        );
        Ok(())
    }
}

impl fmt::Debug for BamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BamWriter")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("records_written", &self.records_written)
            .finish()
    }
}

impl Drop for BamWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Closed {
            warn!("BAM writer for {} dropped without close", self.path.display());
            if let Err(e) = self.close() {
                warn!("finishing {} failed: {}", self.path.display(), e);
            }
        }
    }
}
