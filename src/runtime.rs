//! Explicit runtime context.
//!
//! A [`Runtime`] owns one worker pool shared by every reader and writer it
//! creates. Build it once at program start and call [`Runtime::shutdown`]
//! (or drop it) at the end.
//!
//! ```no_run
//! use bamkit::runtime::Runtime;
//!
//! # fn main() -> bamkit::Result<()> {
//! let runtime = Runtime::new(4)?;
//! let reader = runtime.open_reader("in.bam")?;
//! let mut writer = runtime.create_writer("out.bam")?;
//! writer.write_header(reader.header())?;
//! for record in reader.records()? {
//!     writer.push_read(&record?)?;
//! }
//! writer.close()?;
//! runtime.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::io::bam::{BamReader, BamWriter, ReaderOptions, WriterOptions};
use crate::io::pool::WorkerPool;

/// Shared worker pool and the entry points that use it.
#[derive(Debug, Clone)]
pub struct Runtime {
    pool: Arc<WorkerPool>,
}

impl Runtime {
    /// Start a runtime with `threads` workers (`0` for one per core).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = WorkerPool::new(threads)?;
        debug!("runtime started with {} workers", pool.thread_count());
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// The shared pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Open a reader on the shared pool.
    pub fn open_reader<P: AsRef<Path>>(&self, path: P) -> Result<BamReader> {
        self.open_reader_with(path, ReaderOptions::default())
    }

    /// Open a reader on the shared pool, keeping the other `options`.
    pub fn open_reader_with<P: AsRef<Path>>(&self, path: P, options: ReaderOptions) -> Result<BamReader> {
        BamReader::open_with(path, options.pool(Arc::clone(&self.pool)))
    }

    /// Create a writer on the shared pool.
    pub fn create_writer<P: AsRef<Path>>(&self, path: P) -> Result<BamWriter> {
        self.create_writer_with(path, WriterOptions::default())
    }

    /// Create a writer on the shared pool, keeping the other `options`.
    pub fn create_writer_with<P: AsRef<Path>>(&self, path: P, options: WriterOptions) -> Result<BamWriter> {
        BamWriter::create_with(path, options.pool(Arc::clone(&self.pool)))
    }

    /// Drain outstanding work and join the workers.
    ///
    /// Readers and writers created from this runtime fail with
    /// [`BamError::Worker`](crate::BamError::Worker) afterwards.
    pub fn shutdown(&self) -> Result<()> {
        self.pool.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bam::{Header, Record, Reference};

    #[test]
    fn test_reader_and_writer_share_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bam");
        let runtime = Runtime::new(2).unwrap();

        let header = Header::new("@HD\tVN:1.6\n", vec![Reference::new("chr1", 1000)]);
        let mut writer = runtime.create_writer(&path).unwrap();
        writer.write_header(&header).unwrap();
        let record = Record::builder().name(b"r1").build().unwrap();
        writer.push_read(&record).unwrap();
        writer.close().unwrap();

        let mut reader = runtime.open_reader(&path).unwrap();
        assert!(Arc::ptr_eq(reader.pool(), runtime.pool()));
        assert_eq!(reader.records().unwrap().count(), 1);
        reader.close().unwrap();
        assert!(!runtime.pool().is_shut_down());

        runtime.shutdown().unwrap();
        assert!(runtime.pool().is_shut_down());
        runtime.shutdown().unwrap();
    }
}
