//! Writer → reader round trips.
//!
//! Every field of a record written by `BamWriter` must come back unchanged
//! from `BamReader`, including tags of every type and mutated records.

mod common;

use bamkit::io::bam::{parse_cigar_string, BamReader, BamWriter, Header, Record, Reference, TagValue, WriterOptions};
use bamkit::Result;
use tempfile::tempdir;

fn tagged_record() -> Record {
    let mut record = Record::builder()
        .name(b"pair/1")
        .ref_id(1)
        .position(12_345)
        .mapping_quality(Some(42))
        .flag(0x1 | 0x2 | 0x20 | 0x40)
        .cigar(parse_cigar_string("3S10M2I5M1D4M").unwrap())
        .sequence(b"NNNACGTACGTACGTACGTACGTA")
        .qualities((0..24).map(|i| i as u8 + 10).collect())
        .mate(1, 12_600)
        .template_length(300)
        .build()
        .unwrap();

    let tags = [
        (*b"XA", TagValue::Char(b'Q')),
        (*b"XB", TagValue::Int8(-8)),
        (*b"XC", TagValue::UInt8(200)),
        (*b"XD", TagValue::Int16(-30_000)),
        (*b"XE", TagValue::UInt16(60_000)),
        (*b"XF", TagValue::Int32(-2_000_000_000)),
        (*b"XG", TagValue::UInt32(4_000_000_000)),
        (*b"XH", TagValue::Float(0.25)),
        (*b"XI", TagValue::String("free text".to_string())),
        (*b"XJ", TagValue::Hex("1AE3".to_string())),
        (*b"XK", TagValue::Int8Array(vec![-1, 0, 1])),
        (*b"XL", TagValue::UInt8Array(vec![0, 255])),
        (*b"XM", TagValue::Int16Array(vec![-300, 300])),
        (*b"XN", TagValue::UInt16Array(vec![65_535])),
        (*b"XO", TagValue::Int32Array(vec![i32::MIN, i32::MAX])),
        (*b"XP", TagValue::UInt32Array(vec![u32::MAX])),
        (*b"XQ", TagValue::FloatArray(vec![1.5, -2.5])),
    ];
    for (key, value) in tags {
        record.set_tag(&key, value).unwrap();
    }
    record
}

#[test]
fn test_round_trip_preserves_every_field() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir()?;
    let path = dir.path().join("round_trip.bam");

    let header = common::header();
    let mut records = common::sorted_records(300, 7);
    records.insert(0, tagged_record());
    records.sort_by_key(|r| {
        let ref_id = if r.ref_id() < 0 { i32::MAX } else { r.ref_id() };
        (ref_id, r.position())
    });
    common::write_bam(&path, &header, &records)?;

    let mut reader = BamReader::open(&path)?;
    assert_eq!(reader.header(), &header);
    assert_eq!(reader.header().text(), header.text());

    let read_back: Vec<Record> = reader.records()?.collect::<Result<_>>()?;
    assert_eq!(read_back.len(), records.len());
    for (i, (original, copy)) in records.iter().zip(&read_back).enumerate() {
        assert_eq!(original, copy, "record {} differs", i);
    }

    let tagged = read_back
        .iter()
        .find(|r| r.name() == b"pair/1")
        .expect("tagged record present");
    assert_eq!(tagged.ref_id(), 1);
    assert_eq!(tagged.position(), 12_345);
    assert_eq!(tagged.mapping_quality(), Some(42));
    assert!(tagged.is_paired() && tagged.is_proper_pair() && tagged.is_first_of_pair());
    assert_eq!(tagged.mate_strand(), '-');
    assert_eq!(tagged.mate_position(), 12_600);
    assert_eq!(tagged.template_length(), 300);
    assert_eq!(
        tagged.cigar()?,
        parse_cigar_string("3S10M2I5M1D4M").unwrap()
    );
    assert_eq!(tagged.sequence(), b"NNNACGTACGTACGTACGTACGTA");
    assert_eq!(tagged.base_qualities()[0], 10);
    assert_eq!(tagged.uint32_tag(b"XG")?, Some(4_000_000_000));
    assert_eq!(tagged.float_array_tag(b"XQ")?, Some(vec![1.5, -2.5]));
    assert_eq!(tagged.string_tag(b"XJ")?, Some("1AE3".to_string()));
    assert_eq!(tagged.tag_type_id(b"ZZ")?, 2);

    reader.close()
}

#[test]
fn test_mutated_records_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let input = dir.path().join("input.bam");
    let output = dir.path().join("renamed.bam");

    let header = common::header();
    let records = common::sorted_records(50, 11);
    common::write_bam(&input, &header, &records)?;

    let reader = BamReader::open(&input)?;
    let mut writer = BamWriter::create(&output)?;
    writer.write_header(reader.header())?;
    for record in reader.records()? {
        let mut record = record?;
        let before = record.len();
        let old_name = record.name().len();
        let longer = format!("{}_with_a_much_longer_suffix", String::from_utf8_lossy(record.name()));
        record.set_name(longer.as_bytes())?;
        assert_eq!(record.len(), before + longer.len() - old_name);
        record.set_int32_tag(b"XR", 1)?;
        writer.push_read(&record)?;
    }
    writer.close()?;

    let renamed: Vec<Record> = BamReader::open(&output)?.records()?.collect::<Result<_>>()?;
    assert_eq!(renamed.len(), records.len());
    for (original, copy) in records.iter().zip(&renamed) {
        assert!(copy.name().ends_with(b"_with_a_much_longer_suffix"));
        assert!(copy.name().starts_with(original.name()));
        assert_eq!(copy.ref_id(), original.ref_id());
        assert_eq!(copy.position(), original.position());
        assert_eq!(copy.flag(), original.flag());
        assert_eq!(copy.cigar()?, original.cigar()?);
        assert_eq!(copy.sequence(), original.sequence());
        assert_eq!(copy.base_qualities(), original.base_qualities());
        assert_eq!(copy.uint8_tag(b"NM")?, original.uint8_tag(b"NM")?);
        assert_eq!(copy.int32_tag(b"XR")?, Some(1));
    }
    Ok(())
}

#[test]
fn test_every_compression_level_is_readable() -> Result<()> {
    let dir = tempdir()?;
    let header = Header::new("@HD\tVN:1.6\n", vec![Reference::new("chrM", 16_569)]);
    let records: Vec<Record> = (0..200)
        .map(|i| common::mapped(&format!("m{}", i), 0, i * 50, "50M"))
        .collect();

    for level in -1..=9 {
        let path = dir.path().join(format!("level{}.bam", level));
        let mut writer = BamWriter::create_with(&path, WriterOptions::default().level(level).threads(2))?;
        writer.write_header(&header)?;
        for record in &records {
            writer.push_read(record)?;
        }
        writer.close()?;

        let read_back: Vec<Record> = BamReader::open(&path)?.records()?.collect::<Result<_>>()?;
        assert_eq!(read_back, records, "level {}", level);
    }
    Ok(())
}

#[test]
fn test_empty_file_has_header_only() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty.bam");
    let header = Header::from_text("@HD\tVN:1.6\tSO:unsorted\n");
    common::write_bam(&path, &header, &[])?;

    let reader = BamReader::open(&path)?;
    assert_eq!(reader.header().text(), b"@HD\tVN:1.6\tSO:unsorted\n");
    assert!(reader.references().is_empty());
    assert_eq!(reader.records()?.count(), 0);
    Ok(())
}

#[test]
fn test_non_utf8_header_text_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("latin1.bam");
    let copy = dir.path().join("copy.bam");
    let text = b"@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:500000\n@CO\tBibliothek M\xFCller \xA9 2019\n".to_vec();
    let header = Header::new(text.clone(), vec![Reference::new("chr1", 500_000)]);
    let records = vec![common::mapped("a", 0, 100, "50M"), common::mapped("b", 0, 180, "50M")];
    common::write_bam(&path, &header, &records)?;

    let reader = BamReader::open(&path)?;
    assert_eq!(reader.header().text(), &text[..]);
    assert_eq!(reader.header(), &header);

    // Forwarding the header to a new file keeps every byte
    common::write_bam(&copy, reader.header(), &reader.records()?.collect::<Result<Vec<_>>>()?)?;
    let copied = BamReader::open(&copy)?;
    assert_eq!(copied.header().text(), &text[..]);
    assert_eq!(copied.records()?.count(), 2);
    Ok(())
}
