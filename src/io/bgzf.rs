//! Ordered parallel BGZF streams.
//!
//! [`BgzfReader`] reads raw blocks on the calling thread, hands them to a
//! [`WorkerPool`] for inflation and consumes the results strictly in file
//! order. [`BgzfWriter`] does the reverse: it cuts the byte stream into
//! payloads of at most [`MAX_PAYLOAD_SIZE`] bytes, deflates them on the pool
//! and writes the finished blocks in submission order.
//!
//! Positions inside a BGZF stream are [`VirtualOffset`]s: the compressed
//! offset of a block in the upper 48 bits and the offset inside its payload
//! in the lower 16.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use log::trace;

use super::compression::{
    compress_block, decompress_block, read_block, DEFAULT_COMPRESSION_LEVEL, EOF_MARKER,
    MAX_PAYLOAD_SIZE,
};
use super::pool::{OrderedQueue, WorkerPool};
use crate::error::{BamError, Result};

/// Position in a BGZF stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    /// Combine a block's compressed offset with an offset into its payload.
    pub const fn new(compressed: u64, uncompressed: u16) -> Self {
        Self((compressed << 16) | uncompressed as u64)
    }

    /// Wrap a raw 64-bit virtual offset.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// File offset of the block start.
    pub const fn compressed(self) -> u64 {
        self.0 >> 16
    }

    /// Offset within the decompressed block.
    pub const fn uncompressed(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for VirtualOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressed(), self.uncompressed())
    }
}

/// Function used to turn a raw block into its payload.
pub type BlockDecoder = fn(&[u8]) -> Result<Vec<u8>>;

/// Result of inflating one block on a worker.
struct DecodedBlock {
    offset: u64,
    compressed_size: u64,
    payload: Result<Vec<u8>>,
}

/// BGZF reader with parallel, order-preserving decompression.
///
/// # Example
///
/// ```no_run
/// use std::fs::File;
/// use std::io::Read;
/// use std::sync::Arc;
/// use bamkit::io::bgzf::BgzfReader;
/// use bamkit::io::pool::WorkerPool;
///
/// # fn main() -> bamkit::Result<()> {
/// let pool = Arc::new(WorkerPool::new(4)?);
/// let mut reader = BgzfReader::new(File::open("reads.bam")?, pool);
/// let mut magic = [0u8; 4];
/// reader.read_exact(&mut magic)?;
/// # Ok(())
/// # }
/// ```
pub struct BgzfReader<R> {
    inner: R,
    pool: Arc<WorkerPool>,
    queue: OrderedQueue<DecodedBlock>,
    decoder: BlockDecoder,
    /// Compressed offset of the next raw block to read from `inner`
    read_offset: u64,
    input_done: bool,
    /// Read error held back until every earlier block has been delivered
    deferred: Option<BamError>,
    poisoned: bool,
    block: Vec<u8>,
    block_offset: u64,
    next_block_offset: u64,
    pos: usize,
}

impl<R: Read> BgzfReader<R> {
    /// Create a reader that keeps up to twice the pool's thread count of
    /// blocks in flight.
    pub fn new(inner: R, pool: Arc<WorkerPool>) -> Self {
        let read_ahead = pool.thread_count() * 2;
        Self::with_read_ahead(inner, pool, read_ahead)
    }

    /// Create a reader with an explicit number of blocks in flight.
    pub fn with_read_ahead(inner: R, pool: Arc<WorkerPool>, read_ahead: usize) -> Self {
        Self {
            inner,
            pool,
            queue: OrderedQueue::new(read_ahead),
            decoder: decompress_block,
            read_offset: 0,
            input_done: false,
            deferred: None,
            poisoned: false,
            block: Vec::new(),
            block_offset: 0,
            next_block_offset: 0,
            pos: 0,
        }
    }

    /// Replace the function used to inflate blocks.
    pub fn with_block_decoder(mut self, decoder: BlockDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Position of the next byte [`Read::read`] will return.
    pub fn virtual_offset(&self) -> VirtualOffset {
        if self.pos < self.block.len() {
            VirtualOffset::new(self.block_offset, self.pos as u16)
        } else {
            VirtualOffset::new(self.next_block_offset, 0)
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Top up the queue of in-flight blocks.
    fn fill(&mut self) {
        while self.queue.has_room() && !self.input_done {
            match read_block(&mut self.inner) {
                Ok(Some(raw)) => {
                    let offset = self.read_offset;
                    let compressed_size = raw.len() as u64;
                    self.read_offset += compressed_size;
                    let decoder = self.decoder;
                    let submitted = self.pool.submit(move || DecodedBlock {
                        offset,
                        compressed_size,
                        payload: decoder(&raw),
                    });
                    match submitted {
                        Ok(ticket) => self.queue.push(ticket),
                        Err(e) => {
                            self.deferred = Some(e);
                            self.input_done = true;
                        }
                    }
                }
                Ok(None) => self.input_done = true,
                Err(e) => {
                    self.deferred = Some(e);
                    self.input_done = true;
                }
            }
        }
    }

    /// Advance to the next non-empty block.
    ///
    /// Returns `Ok(false)` at the end of the stream.
    fn next_block(&mut self) -> Result<bool> {
        if self.poisoned {
            return Err(BamError::CorruptBlock(
                "stream is unusable after an earlier error".to_string(),
            ));
        }
        loop {
            self.fill();
            let Some(result) = self.queue.pop_wait() else {
                return match self.deferred.take() {
                    Some(e) => {
                        self.poisoned = true;
                        Err(e)
                    }
                    None => Ok(false),
                };
            };

            let decoded = result.and_then(|d| {
                let DecodedBlock {
                    offset,
                    compressed_size,
                    payload,
                } = d;
                payload.map(|p| (offset, compressed_size, p))
            });
            let (offset, compressed_size, payload) = match decoded {
                Ok(parts) => parts,
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            };

            trace!("block at {} inflated to {} bytes", offset, payload.len());
            self.block = payload;
            self.block_offset = offset;
            self.next_block_offset = offset + compressed_size;
            self.pos = 0;
            if !self.block.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Read exactly `buf.len()` bytes, or nothing at a clean end of stream.
    ///
    /// Returns `Ok(false)` if the stream ended before the first byte.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] if the stream ends part-way.
    pub fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos >= self.block.len() && !self.next_block()? {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(BamError::CorruptBlock(format!(
                    "stream ends after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            let n = (self.block.len() - self.pos).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.block[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(true)
    }
}

impl<R: Read + Seek> BgzfReader<R> {
    /// Jump to `offset`, discarding any read-ahead.
    ///
    /// Clears an earlier failure, so a caller can resume from a known-good
    /// position.
    ///
    /// # Errors
    ///
    /// Returns [`BamError::CorruptBlock`] if the offset points past the end
    /// of its block.
    pub fn seek(&mut self, offset: VirtualOffset) -> Result<()> {
        self.queue.clear();
        self.deferred = None;
        self.poisoned = false;
        self.input_done = false;

        let coffset = offset.compressed();
        self.inner.seek(SeekFrom::Start(coffset))?;
        self.read_offset = coffset;
        self.block.clear();
        self.block_offset = coffset;
        self.next_block_offset = coffset;
        self.pos = 0;

        let upos = offset.uncompressed() as usize;
        if upos > 0 {
            if !self.next_block()? || self.block_offset != coffset || upos > self.block.len() {
                self.poisoned = true;
                return Err(BamError::CorruptBlock(format!(
                    "virtual offset {} lies outside its block",
                    offset
                )));
            }
            self.pos = upos;
        }
        Ok(())
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.block.len() {
            match self.next_block() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => return Err(e.into_io()),
            }
        }
        let n = (self.block.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// BGZF writer with parallel, order-preserving compression.
///
/// Call [`finish`](Self::finish) to write the final block and the EOF
/// marker; dropping an unfinished writer finishes it and ignores errors.
pub struct BgzfWriter<W: Write> {
    inner: Option<W>,
    pool: Arc<WorkerPool>,
    level: i32,
    buffer: Vec<u8>,
    queue: OrderedQueue<Result<Vec<u8>>>,
    compressed_written: u64,
    finished: bool,
}

impl<W: Write> BgzfWriter<W> {
    /// Create a writer at the default compression level.
    pub fn new(inner: W, pool: Arc<WorkerPool>) -> Self {
        let depth = pool.thread_count() * 2;
        Self::with_options(inner, pool, DEFAULT_COMPRESSION_LEVEL, depth)
    }

    /// Create a writer with an explicit level (validated per block) and
    /// number of blocks in flight.
    pub fn with_options(inner: W, pool: Arc<WorkerPool>, level: i32, queue_depth: usize) -> Self {
        Self {
            inner: Some(inner),
            pool,
            level,
            buffer: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            queue: OrderedQueue::new(queue_depth),
            compressed_written: 0,
            finished: false,
        }
    }

    /// Compressed bytes written to the underlying stream so far.
    pub fn compressed_bytes_written(&self) -> u64 {
        self.compressed_written
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> Option<&W> {
        self.inner.as_ref()
    }

    fn sink(&mut self) -> Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or(BamError::ProtocolViolation {
                operation: "write",
                state: "Finished",
            })
    }

    fn write_oldest(&mut self) -> Result<()> {
        if let Some(result) = self.queue.pop_wait() {
            let block = result.and_then(|r| r)?;
            self.sink()?.write_all(&block)?;
            self.compressed_written += block.len() as u64;
        }
        Ok(())
    }

    fn submit_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        while !self.queue.has_room() {
            self.write_oldest()?;
        }
        let payload = std::mem::replace(&mut self.buffer, Vec::with_capacity(MAX_PAYLOAD_SIZE));
        let level = self.level;
        let ticket = self.pool.submit(move || compress_block(&payload, level))?;
        self.queue.push(ticket);
        Ok(())
    }

    /// Append bytes, cutting a block whenever the payload reaches
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(BamError::ProtocolViolation {
                operation: "write",
                state: "Finished",
            });
        }
        while !data.is_empty() {
            let room = MAX_PAYLOAD_SIZE - self.buffer.len();
            let n = room.min(data.len());
            self.buffer.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buffer.len() == MAX_PAYLOAD_SIZE {
                self.submit_buffer()?;
            }
        }
        Ok(())
    }

    /// End the current block early and write every pending block.
    ///
    /// After this returns, all bytes accepted so far are on the underlying
    /// stream and the next write starts a new block.
    pub fn flush_block(&mut self) -> Result<()> {
        self.submit_buffer()?;
        while !self.queue.is_empty() {
            self.write_oldest()?;
        }
        self.sink()?.flush()?;
        Ok(())
    }

    /// Flush everything and write the EOF marker. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_block()?;
        let sink = self.sink()?;
        sink.write_all(&EOF_MARKER)?;
        sink.flush()?;
        self.compressed_written += EOF_MARKER.len() as u64;
        self.finished = true;
        Ok(())
    }

    /// Finish the stream and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.finish()?;
        self.inner.take().ok_or(BamError::ProtocolViolation {
            operation: "into_inner",
            state: "Finished",
        })
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(BamError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block().map_err(BamError::into_io)
    }
}

impl<W: Write> Drop for BgzfWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() && !self.finished {
            let _ = self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(3).unwrap())
    }

    fn bgzf_bytes(data: &[u8], pool: &Arc<WorkerPool>) -> Vec<u8> {
        let mut writer = BgzfWriter::with_options(Vec::new(), Arc::clone(pool), 6, 4);
        writer.write_bytes(data).unwrap();
        writer.into_inner().unwrap()
    }

    #[test]
    fn test_virtual_offset_parts() {
        let vo = VirtualOffset::new(1234, 56);
        assert_eq!(vo.compressed(), 1234);
        assert_eq!(vo.uncompressed(), 56);
        assert_eq!(VirtualOffset::from_raw(vo.raw()), vo);
        assert!(VirtualOffset::new(1, 0) > VirtualOffset::new(0, 65535));
        assert_eq!(vo.to_string(), "1234:56");
    }

    #[test]
    fn test_multi_block_round_trip() {
        let pool = pool();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = bgzf_bytes(&data, &pool);
        assert!(compressed.ends_with(&EOF_MARKER));

        let mut reader = BgzfReader::new(Cursor::new(compressed), Arc::clone(&pool));
        let mut restored = Vec::new();
        reader.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_empty_stream_is_just_eof_marker() {
        let pool = pool();
        let compressed = bgzf_bytes(&[], &pool);
        assert_eq!(compressed, EOF_MARKER.to_vec());

        let mut reader = BgzfReader::new(Cursor::new(compressed), pool);
        let mut buf = [0u8; 4];
        assert!(!reader.read_exact_or_eof(&mut buf).unwrap());
    }

    #[test]
    fn test_flush_block_creates_seekable_boundary() {
        let pool = pool();
        let mut writer = BgzfWriter::with_options(Vec::new(), Arc::clone(&pool), 6, 4);
        writer.write_bytes(b"first part").unwrap();
        writer.flush_block().unwrap();
        let boundary = writer.compressed_bytes_written();
        writer.write_bytes(b"second part").unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut reader = BgzfReader::new(Cursor::new(bytes), pool);
        reader.seek(VirtualOffset::new(boundary, 0)).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"second part");

        reader.seek(VirtualOffset::new(0, 6)).unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"part");
    }

    #[test]
    fn test_virtual_offset_tracks_reads() {
        let pool = pool();
        let mut writer = BgzfWriter::with_options(Vec::new(), Arc::clone(&pool), 6, 4);
        writer.write_bytes(b"abcd").unwrap();
        writer.flush_block().unwrap();
        let second = writer.compressed_bytes_written();
        writer.write_bytes(b"efgh").unwrap();
        let bytes = writer.into_inner().unwrap();

        let mut reader = BgzfReader::new(Cursor::new(bytes), pool);
        assert_eq!(reader.virtual_offset(), VirtualOffset::new(0, 0));
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.virtual_offset(), VirtualOffset::new(0, 2));
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.virtual_offset(), VirtualOffset::new(second, 0));
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.virtual_offset(), VirtualOffset::new(second, 2));
    }

    #[test]
    fn test_corrupt_block_fails_after_good_ones() {
        let pool = pool();
        let mut writer = BgzfWriter::with_options(Vec::new(), Arc::clone(&pool), 6, 4);
        writer.write_bytes(b"good block").unwrap();
        writer.flush_block().unwrap();
        let bad_start = writer.compressed_bytes_written() as usize;
        writer.write_bytes(b"bad block").unwrap();
        let mut bytes = writer.into_inner().unwrap();
        // Flip a CRC byte of the second block
        let second_len = u16::from_le_bytes([bytes[bad_start + 16], bytes[bad_start + 17]]) as usize + 1;
        bytes[bad_start + second_len - 8] ^= 0xFF;

        let mut reader = BgzfReader::new(Cursor::new(bytes), pool);
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"good block");
        let mut more = [0u8; 1];
        let err = reader.read_exact_or_eof(&mut more).unwrap_err();
        assert!(matches!(err, BamError::CorruptBlock(_)));
        // Stays failed
        assert!(reader.read_exact_or_eof(&mut more).is_err());
    }

    #[test]
    fn test_truncated_stream_reports_corruption() {
        let pool = pool();
        let bytes = bgzf_bytes(b"some data that will be cut", &pool);
        let cut = bytes[..bytes.len() - EOF_MARKER.len() - 4].to_vec();
        let mut reader = BgzfReader::new(Cursor::new(cut), pool);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert!(matches!(BamError::from(err), BamError::CorruptBlock(_)));
    }

    #[test]
    fn test_write_after_finish_rejected() {
        let pool = pool();
        let mut writer = BgzfWriter::new(Vec::new(), pool);
        writer.finish().unwrap();
        writer.finish().unwrap();
        assert!(matches!(
            writer.write_bytes(b"late"),
            Err(BamError::ProtocolViolation { .. })
        ));
    }
}
