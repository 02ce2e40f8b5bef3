//! Block codec and record decoding throughput.
//!
//! - `bgzf_block`: single-block compress/decompress at a few levels
//! - `bgzf_stream`: whole-stream decompression with 1 vs N pool workers
//! - `record_decode`: parsing record bodies and reading common fields

use std::io::{Cursor, Read};
use std::sync::Arc;

use bamkit::io::bam::{parse_cigar_string, Record, TagValue};
use bamkit::io::bgzf::{BgzfReader, BgzfWriter};
use bamkit::io::compression::{compress_block, decompress_block, MAX_PAYLOAD_SIZE};
use bamkit::io::pool::{default_thread_count, WorkerPool};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Alignment-like payload: repetitive bases with some variation.
fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            b"ACGTACGTNNACGT"[(state % 14) as usize]
        })
        .collect()
}

fn bench_block_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("bgzf_block");
    let data = payload(MAX_PAYLOAD_SIZE);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for level in [1, 6, 9] {
        group.bench_with_input(BenchmarkId::new("compress", level), &level, |b, &level| {
            b.iter(|| compress_block(black_box(&data), level))
        });
    }

    let block = compress_block(&data, 6).expect("block compresses");
    group.bench_function("decompress", |b| b.iter(|| decompress_block(black_box(&block))));
    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("bgzf_stream");
    let data = payload(64 * MAX_PAYLOAD_SIZE);
    group.throughput(Throughput::Bytes(data.len() as u64));

    let writer_pool = Arc::new(WorkerPool::new(0).expect("pool starts"));
    let mut writer = BgzfWriter::new(Vec::new(), Arc::clone(&writer_pool));
    writer.write_bytes(&data).expect("payload written");
    let compressed = writer.into_inner().expect("stream finished");

    for threads in [1, default_thread_count()] {
        let pool = Arc::new(WorkerPool::new(threads).expect("pool starts"));
        group.bench_with_input(BenchmarkId::new("decompress", threads), &compressed, |b, compressed| {
            b.iter(|| {
                let mut reader = BgzfReader::new(Cursor::new(compressed.as_slice()), Arc::clone(&pool));
                let mut out = Vec::with_capacity(data.len());
                reader.read_to_end(&mut out).expect("stream decodes");
                out.len()
            })
        });
    }
    group.finish();
}

fn bench_record_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_decode");
    let sequence = payload(150);
    let record = Record::builder()
        .name(b"HWI-ST1234:8:1101:1234:5678")
        .ref_id(0)
        .position(1_000_000)
        .mapping_quality(Some(60))
        .cigar(parse_cigar_string("10S100M5D40M").expect("valid CIGAR"))
        .sequence(&sequence)
        .qualities(vec![30; 150])
        .tag(b"NM", TagValue::UInt8(5))
        .tag(b"MD", TagValue::String("50A49^ACGTA40".to_string()))
        .tag(b"RG", TagValue::String("sample1".to_string()))
        .build()
        .expect("record builds");
    let bytes = record.into_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("from_bytes", |b| {
        b.iter(|| Record::from_bytes(black_box(bytes.clone())))
    });

    let parsed = Record::from_bytes(bytes.clone()).expect("record parses");
    group.bench_function("fields", |b| {
        b.iter(|| {
            let record = black_box(&parsed);
            (
                record.cigar().map(|c| c.len()),
                record.sequence().len(),
                record.string_tag(b"RG").ok().flatten(),
                record.end_position(),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, bench_block_codec, bench_stream, bench_record_decode);
criterion_main!(benches);
