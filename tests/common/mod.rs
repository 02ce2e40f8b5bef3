//! Synthetic BAM data shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;

use bamkit::io::bam::cigar::query_length;
use bamkit::io::bam::{parse_cigar_string, BamWriter, Header, Record, Reference, TagValue};
use bamkit::Result;

pub const CHR1_LENGTH: u32 = 500_000;
pub const CHR2_LENGTH: u32 = 500_000;

pub fn header() -> Header {
    Header::new(
        "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:500000\n@SQ\tSN:chr2\tLN:500000\n@PG\tID:synthetic\n",
        vec![
            Reference::new("chr1", CHR1_LENGTH),
            Reference::new("chr2", CHR2_LENGTH),
        ],
    )
}

/// Small deterministic generator so runs are reproducible.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

const CIGARS: &[&str] = &["50M", "20M5D30M", "10S40M", "25M100N25M", "30M2I18M", "45M5H"];

/// A mapped record with a sequence matching `cigar`.
pub fn mapped(name: &str, ref_id: i32, position: i32, cigar: &str) -> Record {
    let ops = parse_cigar_string(cigar).unwrap();
    let len = query_length(&ops) as usize;
    let sequence: Vec<u8> = (0..len).map(|i| b"ACGT"[(i + position as usize) % 4]).collect();
    let qualities: Vec<u8> = (0..len).map(|i| 20 + (i % 20) as u8).collect();
    Record::builder()
        .name(name.as_bytes())
        .ref_id(ref_id)
        .position(position)
        .mapping_quality(Some(60))
        .cigar(ops)
        .sequence(&sequence)
        .qualities(qualities)
        .tag(b"NM", TagValue::UInt8(0))
        .build()
        .unwrap()
}

/// Coordinate-sorted records on both references plus a few unplaced reads.
pub fn sorted_records(per_reference: usize, seed: u64) -> Vec<Record> {
    let mut rng = Lcg::new(seed);
    let mut records = Vec::new();
    for ref_id in 0..2 {
        let mut position = rng.below(100) as i32;
        for i in 0..per_reference {
            position += rng.below(60) as i32;
            let cigar = CIGARS[rng.below(CIGARS.len() as u64) as usize];
            records.push(mapped(&format!("r{}_{}", ref_id, i), ref_id, position, cigar));
        }
    }
    for i in 0..3 {
        let mut unplaced = Record::builder()
            .name(format!("unplaced_{}", i).as_bytes())
            .sequence(b"NNNN")
            .build()
            .unwrap();
        unplaced.set_is_unmapped(true);
        records.push(unplaced);
    }
    records
}

pub fn write_bam(path: &Path, header: &Header, records: &[Record]) -> Result<()> {
    let mut writer = BamWriter::create(path)?;
    writer.write_header(header)?;
    for record in records {
        writer.push_read(record)?;
    }
    writer.close()
}

/// Half-open reference interval a record occupies for overlap tests.
pub fn span(record: &Record) -> (i64, i64) {
    let start = record.position() as i64;
    (start, start + record.reference_span().max(1) as i64)
}
