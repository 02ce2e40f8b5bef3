//! BAM (Binary Alignment Map) reading, indexing, writing and pileup.
//!
//! # Layout
//!
//! - [`record`]: buffer-backed alignment records with field getters/setters
//! - [`cigar`], [`sequence`], [`tags`], [`md`]: the variable-length parts of a record
//! - [`header`]: header text and the reference table
//! - [`index`]: BAI coordinate index for region queries
//! - [`reader`] / [`writer`]: file-level access on top of [`crate::io::bgzf`]
//! - [`pileup`]: per-position columns over a sorted record stream
//!
//! Records own their bytes. Nothing in a [`Record`] points back at the
//! reader it came from; operations that need the reference table, such as
//! [`Record::reference_name`], take it as a parameter.
//!
//! # Reading
//!
//! ```no_run
//! use bamkit::io::bam::BamReader;
//!
//! # fn main() -> bamkit::Result<()> {
//! let mut reader = BamReader::open("alignments.bam")?;
//! println!("{} references", reader.header().reference_count());
//!
//! for record in reader.records()? {
//!     let record = record?;
//!     println!("{}", record.to_sam(reader.references())?);
//! }
//!
//! // Region query; builds alignments.bam.bai on first use
//! for record in reader.fetch("chr1", 10_000, 20_000)? {
//!     let record = record?;
//!     println!("{} at {}", String::from_utf8_lossy(record.name()), record.position());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Writing
//!
//! ```no_run
//! use bamkit::io::bam::{parse_cigar_string, BamWriter, Header, Record, Reference};
//!
//! # fn main() -> bamkit::Result<()> {
//! let header = Header::new("@HD\tVN:1.6\tSO:coordinate\n", vec![Reference::new("chr1", 248_956_422)]);
//! let record = Record::builder()
//!     .name(b"read1")
//!     .ref_id(0)
//!     .position(100)
//!     .cigar(parse_cigar_string("4M")?)
//!     .sequence(b"ACGT")
//!     .build()?;
//!
//! let mut writer = BamWriter::create("out.bam")?;
//! writer.write_header(&header)?;
//! writer.push_read(&record)?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cigar;
pub mod header;
pub mod index;
pub mod md;
pub mod pileup;
pub mod reader;
pub mod record;
pub mod sequence;
pub mod tags;
pub mod writer;

pub use cigar::{format_cigar, parse_cigar, parse_cigar_string, CigarOp};
pub use header::{Header, Reference};
pub use index::{Chunk, CoordinateIndex, VirtualOffset};
pub use md::{extended_cigar, reconstruct_reference};
pub use pileup::{Pileup, PileupColumn, PileupOptions, PileupRead};
pub use reader::{BamReader, Fetch, IndexPolicy, ReaderOptions, Records};
pub use record::{read_record, Record, RecordBuilder};
pub use sequence::{decode_sequence, encode_sequence};
pub use tags::{TagKey, TagType, TagValue};
pub use writer::{BamWriter, WriterOptions, WriterState};
