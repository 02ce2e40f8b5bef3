//! Ordering and failure behavior of the parallel BGZF pipeline.

mod common;

use std::fs::{self, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bamkit::io::bam::{BamReader, Record};
use bamkit::io::bgzf::{BgzfReader, BgzfWriter};
use bamkit::io::compression::{compress_block, decompress_block, EOF_MARKER, MAX_PAYLOAD_SIZE};
use bamkit::io::pool::WorkerPool;
use bamkit::{BamError, Result};
use tempfile::tempdir;

const BLOCKS: usize = 24;

fn payload(i: usize) -> Vec<u8> {
    vec![i as u8; 500 + i * 37]
}

/// Inflate, then wait longer for earlier blocks so they finish last.
fn slow_decoder(raw: &[u8]) -> Result<Vec<u8>> {
    let payload = decompress_block(raw)?;
    let index = payload.first().copied().unwrap_or(0) as u64;
    thread::sleep(Duration::from_millis((BLOCKS as u64 - index) * 2));
    Ok(payload)
}

#[test]
fn test_blocks_come_back_in_order_despite_delays() -> Result<()> {
    let mut stream = Vec::new();
    for i in 0..BLOCKS {
        stream.extend(compress_block(&payload(i), 6)?);
    }
    stream.extend_from_slice(&EOF_MARKER);

    let pool = Arc::new(WorkerPool::new(4)?);
    let mut reader = BgzfReader::with_read_ahead(Cursor::new(stream), Arc::clone(&pool), 8).with_block_decoder(slow_decoder);
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded)?;

    let expected: Vec<u8> = (0..BLOCKS).flat_map(payload).collect();
    assert_eq!(decoded, expected);
    pool.shutdown()
}

#[test]
fn test_parallel_writer_preserves_order() -> Result<()> {
    let pool = Arc::new(WorkerPool::new(4)?);
    let mut writer = BgzfWriter::with_options(Vec::new(), Arc::clone(&pool), 6, 8);
    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk: Vec<u8> = (0..1_000).map(|j| ((i * 7 + j) % 251) as u8).collect();
        writer.write_all(&chunk)?;
        expected.extend(chunk);
    }
    let compressed = writer.into_inner()?;
    assert!(compressed.ends_with(&EOF_MARKER));
    assert!(expected.len() > 2 * MAX_PAYLOAD_SIZE);

    let mut decoded = Vec::new();
    BgzfReader::new(Cursor::new(compressed), Arc::clone(&pool)).read_to_end(&mut decoded)?;
    assert_eq!(decoded, expected);
    Ok(())
}

#[test]
fn test_block_codec_sizes_and_levels() -> Result<()> {
    let pattern: Vec<u8> = (0..65_535u32).map(|i| b"ACGTTGCA"[(i % 8) as usize]).collect();
    for payload in [&b""[..], &b"A"[..], &pattern[..]] {
        for level in -1..=9 {
            let block = compress_block(payload, level)?;
            assert_eq!(decompress_block(&block)?, payload, "level {} size {}", level, payload.len());
        }
    }
    Ok(())
}

fn sample_file(dir: &std::path::Path) -> Result<(std::path::PathBuf, Vec<Record>)> {
    let path = dir.join("sample.bam");
    let records = common::sorted_records(1_500, 13);
    common::write_bam(&path, &common::header(), &records)?;
    Ok((path, records))
}

/// Size of the block starting at `offset`.
fn block_size(bytes: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([bytes[offset + 16], bytes[offset + 17]]) as usize + 1
}

#[test]
fn test_flipped_byte_fails_cleanly() -> Result<()> {
    let dir = tempdir()?;
    let (path, records) = sample_file(dir.path())?;

    let mut bytes = fs::read(&path)?;
    let second = block_size(&bytes, 0);
    let target = second + block_size(&bytes, second) / 2;
    bytes[target] ^= 0xFF;
    fs::write(&path, &bytes)?;

    let reader = BamReader::open(&path)?;
    let mut records_read = 0;
    let mut failure = None;
    let mut iter = reader.records()?;
    for result in iter.by_ref() {
        match result {
            Ok(_) => records_read += 1,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert!(matches!(failure, Some(BamError::CorruptBlock(_))));
    assert!(records_read < records.len());
    assert!(iter.next().is_none());
    Ok(())
}

#[test]
fn test_truncated_file_fails_cleanly() -> Result<()> {
    let dir = tempdir()?;
    let (path, records) = sample_file(dir.path())?;

    // Cut in the middle of the block that holds the two-thirds mark
    let bytes = fs::read(&path)?;
    let mark = bytes.len() * 2 / 3;
    let mut offset = 0;
    while offset + block_size(&bytes, offset) <= mark {
        offset += block_size(&bytes, offset);
    }
    let cut = offset + block_size(&bytes, offset) / 2;
    OpenOptions::new().write(true).open(&path)?.set_len(cut as u64)?;

    let reader = BamReader::open(&path)?;
    let results: Vec<Result<Record>> = reader.records()?.collect();
    let last = results.last().expect("at least one result");
    assert!(matches!(last, Err(BamError::CorruptBlock(_))));
    let good = results.iter().filter(|r| r.is_ok()).count();
    assert!(good < records.len());
    assert_eq!(good, results.len() - 1);
    Ok(())
}

#[test]
fn test_open_rejects_non_bam_input() -> Result<()> {
    let dir = tempdir()?;

    let missing = dir.path().join("missing.bam");
    assert!(matches!(BamReader::open(&missing), Err(BamError::OpenFailed { .. })));

    let text = dir.path().join("text.bam");
    fs::write(&text, b"@HD\tVN:1.6\nthis is SAM, not BAM\n")?;
    assert!(matches!(BamReader::open(&text), Err(BamError::OpenFailed { .. })));

    // Valid BGZF whose payload has the wrong magic
    let wrong_magic = dir.path().join("wrong_magic.bam");
    let mut file = fs::File::create(&wrong_magic)?;
    file.write_all(&compress_block(b"CRAM\x03\x00\x00\x00\x00", 6)?)?;
    file.write_all(&EOF_MARKER)?;
    drop(file);
    assert!(matches!(BamReader::open(&wrong_magic), Err(BamError::OpenFailed { .. })));

    // Header cut off after the magic
    let truncated = dir.path().join("truncated.bam");
    let mut file = fs::File::create(&truncated)?;
    file.write_all(&compress_block(b"BAM\x01\x10\x00", 6)?)?;
    file.write_all(&EOF_MARKER)?;
    drop(file);
    assert!(matches!(BamReader::open(&truncated), Err(BamError::OpenFailed { .. })));
    Ok(())
}

#[test]
fn test_shut_down_pool_surfaces_worker_error() -> Result<()> {
    let dir = tempdir()?;
    let (path, _) = sample_file(dir.path())?;
    let pool = Arc::new(WorkerPool::new(2)?);
    let reader = BamReader::open_with(&path, bamkit::io::bam::ReaderOptions::default().pool(Arc::clone(&pool)))?;
    pool.shutdown()?;

    let first = reader
        .records()
        .and_then(|mut records| records.next().transpose());
    assert!(matches!(first, Err(BamError::Worker(_))));
    Ok(())
}
