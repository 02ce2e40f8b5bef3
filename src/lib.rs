//! bamkit: streaming BAM I/O, region queries and pileup
//!
//! # Overview
//!
//! bamkit reads, indexes, randomly accesses, mutates and writes alignment
//! records stored in BGZF-compressed BAM files. Block (de)compression runs on
//! a worker pool; everything else is single-threaded per reader, writer or
//! pileup and streams with bounded memory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bamkit::{BamReader, Pileup, PileupOptions};
//!
//! # fn main() -> bamkit::Result<()> {
//! let mut reader = BamReader::open("alignments.bam")?;
//!
//! for record in reader.records()? {
//!     let record = record?;
//!     // One record at a time
//! }
//!
//! let region = reader.fetch("chr1", 1_000, 2_000)?;
//! for column in Pileup::new(region, PileupOptions::default()) {
//!     let column = column?;
//!     println!("{}\t{}", column.position(), column.coverage());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`io`]: BGZF blocks, the worker pool, and the BAM reader/writer/pileup
//! - [`error`]: [`BamError`] and the crate [`Result`]
//! - [`runtime`]: a shared pool passed explicitly to readers and writers
//! - [`boundary`]: two-call record transfer and last-error text for FFI hosts

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod boundary;
pub mod error;
pub mod io;
pub mod runtime;

// Re-export commonly used types
pub use error::{BamError, Result};
pub use io::bam::{
    BamReader, BamWriter, CigarOp, Header, Pileup, PileupColumn, PileupOptions, Record, Reference, TagValue,
};
pub use io::pool::WorkerPool;
pub use runtime::Runtime;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
