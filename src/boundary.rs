//! Helpers for exposing the engine across a foreign-function boundary.
//!
//! A host runtime that cannot hold Rust values pulls records with two calls
//! per item: ask for the size of the next record, then hand over a buffer of
//! exactly that size to be filled. The buffer belongs to the caller from the
//! start, so nothing allocated here has to be released by the host.
//!
//! Calls that can only return a number report failure through a sentinel
//! and record the error text for the calling thread, retrievable with
//! [`last_error_message`].
//!
//! ```
//! use bamkit::boundary::{last_error_message, status, RecordCursor};
//! use bamkit::io::bam::Record;
//!
//! let records: Vec<bamkit::Result<Record>> = vec![Ok(Record::default())];
//! let mut cursor = RecordCursor::new(records.into_iter());
//!
//! let size = cursor.front_alloc_size().unwrap();
//! let mut buffer = vec![0u8; size];
//! assert_eq!(status(cursor.copy_into_and_pop_front(&mut buffer)), 0);
//! assert_eq!(Record::from_bytes(buffer).unwrap().name(), b"*");
//!
//! let mut wrong = vec![0u8; 3];
//! assert_eq!(status(cursor.copy_into_and_pop_front(&mut wrong)), -1);
//! assert!(last_error_message().is_some());
//! ```

use std::cell::RefCell;

use crate::error::{BamError, Result};
use crate::io::bam::Record;

/// Status returned for a successful call.
pub const STATUS_OK: i32 = 0;

/// Status returned for a failed call.
pub const STATUS_ERROR: i32 = -1;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record `error` as the calling thread's last failure.
pub fn set_last_error(error: &BamError) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error.to_string()));
}

/// Text of the calling thread's last recorded failure.
pub fn last_error_message() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Forget the calling thread's last failure.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Map a result to [`STATUS_OK`] or [`STATUS_ERROR`], recording the error.
pub fn status<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => {
            set_last_error(&e);
            STATUS_ERROR
        }
    }
}

/// Unwrap a result, substituting `sentinel` and recording the error on failure.
pub fn value_or<T>(result: Result<T>, sentinel: T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            set_last_error(&e);
            sentinel
        }
    }
}

/// Two-call pull cursor over a record stream.
///
/// Wraps any record iterator, such as [`Records`](crate::io::bam::Records)
/// or [`Fetch`](crate::io::bam::Fetch).
pub struct RecordCursor<I> {
    records: I,
    front: Option<Record>,
    done: bool,
}

impl<I> RecordCursor<I>
where
    I: Iterator<Item = Result<Record>>,
{
    /// Wrap a record stream.
    pub fn new(records: I) -> Self {
        Self {
            records,
            front: None,
            done: false,
        }
    }

    fn fill_front(&mut self) -> Result<Option<&Record>> {
        if self.front.is_none() && !self.done {
            match self.records.next() {
                Some(Ok(record)) => self.front = Some(record),
                Some(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                None => self.done = true,
            }
        }
        Ok(self.front.as_ref())
    }

    /// Size in bytes of the next record body, or `0` when exhausted.
    pub fn front_alloc_size(&mut self) -> Result<usize> {
        Ok(self.fill_front()?.map_or(0, Record::len))
    }

    /// Copy the next record body into `buffer` and advance.
    ///
    /// # Errors
    ///
    /// [`BamError::OutOfRange`] if `buffer` is not exactly
    /// [`front_alloc_size`](Self::front_alloc_size) bytes or the stream is
    /// exhausted. The record stays at the front on a size mismatch.
    pub fn copy_into_and_pop_front(&mut self, buffer: &mut [u8]) -> Result<()> {
        let record = self
            .fill_front()?
            .ok_or_else(|| BamError::OutOfRange("no record left to copy".to_string()))?;
        if record.len() != buffer.len() {
            return Err(BamError::OutOfRange(format!(
                "buffer holds {} bytes but the record needs {}",
                buffer.len(),
                record.len()
            )));
        }
        buffer.copy_from_slice(record.as_bytes());
        self.front = None;
        Ok(())
    }

    /// Take the next record without copying.
    pub fn pop_front(&mut self) -> Result<Option<Record>> {
        self.fill_front()?;
        Ok(self.front.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &[u8]) -> Record {
        Record::builder().name(name).build().unwrap()
    }

    #[test]
    fn test_two_call_protocol() {
        let records: Vec<Result<Record>> = vec![Ok(named(b"first")), Ok(named(b"second-read"))];
        let mut cursor = RecordCursor::new(records.into_iter());

        let mut names = Vec::new();
        loop {
            let size = cursor.front_alloc_size().unwrap();
            if size == 0 {
                break;
            }
            let mut buffer = vec![0u8; size];
            cursor.copy_into_and_pop_front(&mut buffer).unwrap();
            names.push(Record::from_bytes(buffer).unwrap().name().to_vec());
        }
        assert_eq!(names, vec![b"first".to_vec(), b"second-read".to_vec()]);
        assert_eq!(cursor.front_alloc_size().unwrap(), 0);
    }

    #[test]
    fn test_size_mismatch_keeps_front() {
        let records: Vec<Result<Record>> = vec![Ok(named(b"r1"))];
        let mut cursor = RecordCursor::new(records.into_iter());
        let size = cursor.front_alloc_size().unwrap();
        let mut short = vec![0u8; size - 1];
        assert!(matches!(
            cursor.copy_into_and_pop_front(&mut short),
            Err(BamError::OutOfRange(_))
        ));
        assert_eq!(cursor.front_alloc_size().unwrap(), size);
        assert_eq!(cursor.pop_front().unwrap().unwrap().name(), b"r1");
        assert!(cursor.pop_front().unwrap().is_none());
    }

    #[test]
    fn test_copy_when_exhausted() {
        let mut cursor = RecordCursor::new(Vec::<Result<Record>>::new().into_iter());
        assert!(matches!(
            cursor.copy_into_and_pop_front(&mut []),
            Err(BamError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_stream_error_surfaces_then_ends() {
        let records: Vec<Result<Record>> = vec![Err(BamError::CorruptBlock("truncated block".to_string()))];
        let mut cursor = RecordCursor::new(records.into_iter());
        assert!(matches!(cursor.front_alloc_size(), Err(BamError::CorruptBlock(_))));
        assert_eq!(cursor.front_alloc_size().unwrap(), 0);
    }

    #[test]
    fn test_last_error_is_per_thread() {
        clear_last_error();
        assert_eq!(status(Ok::<_, BamError>(5)), STATUS_OK);
        assert!(last_error_message().is_none());

        let failed: Result<u32> = Err(BamError::UnknownReference("chrZ".to_string()));
        assert_eq!(value_or(failed, u32::MAX), u32::MAX);
        let message = last_error_message().unwrap();
        assert!(message.contains("chrZ"));

        let other = std::thread::spawn(last_error_message).join().unwrap();
        assert!(other.is_none());

        clear_last_error();
        assert!(last_error_message().is_none());
    }
}
