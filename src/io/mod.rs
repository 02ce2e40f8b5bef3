//! I/O module: block compression, the worker pool and BAM access
//!
//! Layers, bottom up:
//!
//! - [`compression`]: single BGZF blocks
//! - [`pool`]: worker threads with order-preserving result tickets
//! - [`bgzf`]: streaming BGZF reader/writer that spread blocks over a pool
//! - [`bam`]: records, index, reader, writer and pileup

pub mod bam;
pub mod bgzf;
pub mod compression;
pub mod pool;

pub use bam::{BamReader, BamWriter, Pileup, Record};
pub use bgzf::{BgzfReader, BgzfWriter, VirtualOffset};
pub use pool::WorkerPool;
