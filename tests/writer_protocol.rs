//! BamWriter call ordering and the two-call record transfer.

mod common;

use std::sync::Arc;

use bamkit::boundary::{last_error_message, status, RecordCursor, STATUS_ERROR, STATUS_OK};
use bamkit::io::bam::{BamReader, BamWriter, Record, WriterOptions, WriterState};
use bamkit::{BamError, Result, Runtime};
use tempfile::{tempdir, NamedTempFile};

#[test]
fn test_read_before_references_is_rejected_without_output() -> Result<()> {
    let file = NamedTempFile::new()?;
    let header = common::header();
    let record = common::mapped("early", 0, 10, "50M");

    let mut writer = BamWriter::create(file.path())?;
    assert!(matches!(
        writer.push_read(&record),
        Err(BamError::ProtocolViolation { operation: "push_read", .. })
    ));
    assert_eq!(writer.state(), WriterState::Created);

    writer.push_header(&header)?;
    assert!(matches!(
        writer.push_read(&record),
        Err(BamError::ProtocolViolation { .. })
    ));
    assert_eq!(writer.state(), WriterState::HeaderWritten);

    writer.push_ref_info(header.references())?;
    assert!(matches!(
        writer.push_header(&header),
        Err(BamError::ProtocolViolation { .. })
    ));
    writer.push_read(&record)?;
    assert_eq!(writer.state(), WriterState::Writing);
    writer.close()?;
    assert_eq!(writer.state(), WriterState::Closed);
    assert!(matches!(writer.push_read(&record), Err(BamError::ProtocolViolation { .. })));
    writer.close()?;

    // Only the accepted record made it into the file
    let records: Vec<Record> = BamReader::open(file.path())?.records()?.collect::<Result<_>>()?;
    assert_eq!(records, vec![record]);
    Ok(())
}

#[test]
fn test_writers_share_runtime_pool() -> Result<()> {
    let dir = tempdir()?;
    let runtime = Runtime::new(3)?;
    let header = common::header();
    let records = common::sorted_records(200, 31);

    let paths: Vec<_> = (0..3).map(|i| dir.path().join(format!("out{}.bam", i))).collect();
    let mut writers = paths
        .iter()
        .map(|p| runtime.create_writer_with(p, WriterOptions::default().level(1)))
        .collect::<Result<Vec<_>>>()?;
    for writer in &mut writers {
        writer.write_header(&header)?;
    }
    for (i, record) in records.iter().enumerate() {
        writers[i % 3].push_read(record)?;
    }
    let written: u64 = writers.iter().map(|w| w.records_written()).sum();
    assert_eq!(written as usize, records.len());
    for writer in &mut writers {
        writer.close()?;
    }
    assert!(!runtime.pool().is_shut_down());

    let mut total = 0;
    for path in &paths {
        let reader = runtime.open_reader(path)?;
        assert!(Arc::ptr_eq(reader.pool(), runtime.pool()));
        total += reader.records()?.count();
    }
    assert_eq!(total, records.len());
    runtime.shutdown()
}

#[test]
fn test_two_call_transfer_from_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("transfer.bam");
    let records = common::sorted_records(100, 9);
    common::write_bam(&path, &common::header(), &records)?;

    let reader = BamReader::open(&path)?;
    let mut cursor = RecordCursor::new(reader.records()?);
    let mut copied = Vec::new();
    loop {
        let size = cursor.front_alloc_size()?;
        if size == 0 {
            break;
        }
        // Host-owned buffer, filled in place
        let mut buffer = vec![0u8; size];
        assert_eq!(status(cursor.copy_into_and_pop_front(&mut buffer)), STATUS_OK);
        copied.push(Record::from_bytes(buffer)?);
    }
    assert_eq!(copied, records);

    let mut reader = BamReader::open(&path)?;
    assert_eq!(status(reader.fetch("chrUn", 0, 1)), STATUS_ERROR);
    assert!(last_error_message().unwrap_or_default().contains("chrUn"));
    Ok(())
}
