//! A single-producer/single-consumer bounded byte buffer used for framed
//! reads and writes over one descriptor.
//!
//! This is a Rust realization of the `n_buf` type from the original source:
//! a fixed-capacity contiguous region with `start <= end <= capacity`, where
//! `[start, end)` holds unread bytes. `fill` appends bytes read from a
//! descriptor to the tail; `get_msg` extracts the next newline-terminated
//! frame from the head; `pullup` compacts unread bytes back to offset 0 to
//! maximize the writable tail.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The single-byte frame delimiter. The wire format never escapes it.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Returned by [`NBuf::reserve`]/write paths when a caller tries to put more
/// bytes into the buffer than remain after a `pullup`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no buffer space")]
pub struct NoBufferSpace;

/// A fixed-capacity byte buffer with pull-up semantics.
#[derive(Debug)]
pub struct NBuf {
    buf: BytesMut,
    start: usize,
    end: usize,
    capacity: usize,
}

impl NBuf {
    /// Allocates a buffer of exactly `capacity` bytes.
    pub fn init(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.resize(capacity, 0);
        NBuf {
            buf,
            start: 0,
            end: 0,
            capacity,
        }
    }

    /// Drops all buffered content, returning the buffer to its just-`init`ed
    /// state without reallocating.
    pub fn destroy(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Bytes of writable tail space remaining before a `pullup` would be
    /// needed.
    pub fn tail_space(&self) -> usize {
        self.capacity - self.end
    }

    /// Compacts the unread region `[start, end)` down to offset 0. Applying
    /// this twice in a row is equivalent to applying it once.
    pub fn pullup(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Non-blocking fill: reads as many bytes as are immediately available
    /// into the tail, never more than `capacity - end`. Returns `Ok(true)`
    /// when the underlying stream reported orderly shutdown (EOF).
    pub async fn fill<R: AsyncRead + Unpin>(
        &mut self,
        r: &mut R,
    ) -> std::io::Result<bool> {
        if self.end >= self.capacity {
            return Ok(false);
        }

        let n = r.read(&mut self.buf[self.end..self.capacity]).await?;
        if n == 0 {
            return Ok(true);
        }

        self.end += n;
        Ok(false)
    }

    /// Extracts the next newline-terminated frame, if one is fully buffered.
    /// The terminator itself is consumed but not included in the returned
    /// bytes. Repeated calls return frames in the order they were written.
    pub fn get_msg(&mut self) -> Option<Bytes> {
        let region = &self.buf[self.start..self.end];
        let pos = region.iter().position(|&b| b == LINE_TERMINATOR)?;

        let frame = Bytes::copy_from_slice(&self.buf[self.start..self.start + pos]);
        self.start += pos + 1;

        Some(frame)
    }

    /// Appends `data` to the tail, pulling up first if needed. Fails with
    /// [`NoBufferSpace`] if `data` does not fit even after pulling up; the
    /// buffer is left unmodified in that case.
    pub fn push(&mut self, data: &[u8]) -> Result<(), NoBufferSpace> {
        if data.len() > self.tail_space() {
            self.pullup();
        }
        if data.len() > self.tail_space() {
            return Err(NoBufferSpace);
        }

        (&mut self.buf[self.end..self.end + data.len()]).put_slice(data);
        self.end += data.len();

        Ok(())
    }

    /// Returns the unread region as a byte slice, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Advances `start` by `n` bytes, as a partial write consumes from the
    /// head of the unread region. `n` must not exceed `len()`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start = (self.start + n).min(self.end);
    }

    /// Transfers `src`'s buffered content into `dst`, leaving `src` empty.
    /// Realized as an ownership swap rather than a byte-for-byte copy, since
    /// Rust's move semantics make that the natural analogue of "copy, then
    /// drop the source" for a type with no external aliases.
    pub fn copy(dst: &mut NBuf, src: &mut NBuf) {
        std::mem::swap(dst, src);
        src.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut nb = NBuf::init(64);
        let mut src = Cursor::new(b"hello\nworld\n".to_vec());

        nb.fill(&mut src).await.unwrap();

        assert_eq!(nb.get_msg().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(nb.get_msg().unwrap(), Bytes::from_static(b"world"));
        assert!(nb.get_msg().is_none());
    }

    #[tokio::test]
    async fn frame_round_trip_arbitrary_bytes() {
        // Any byte sequence without the terminator survives a fill/get_msg
        // round trip verbatim, including embedded NULs and high bytes.
        let payload: &[u8] = b"\x00abc\xffdef";
        let mut nb = NBuf::init(64);
        let mut framed = payload.to_vec();
        framed.push(LINE_TERMINATOR);
        let mut src = Cursor::new(framed);

        nb.fill(&mut src).await.unwrap();

        assert_eq!(nb.get_msg().unwrap(), Bytes::copy_from_slice(payload));
    }

    #[test]
    fn pullup_is_idempotent() {
        let mut nb = NBuf::init(16);
        nb.push(b"ab").unwrap();
        nb.get_msg(); // no-op, no terminator yet; leaves start at 0

        nb.push(b"c\n").unwrap();
        let _ = nb.get_msg(); // consumes "abc", start now past end -> both 0

        nb.push(b"tail").unwrap();
        let before_first = nb.peek().to_vec();

        nb.pullup();
        let once = nb.peek().to_vec();
        nb.pullup();
        let twice = nb.peek().to_vec();

        assert_eq!(once, twice);
        assert_eq!(once, before_first);
    }

    #[test]
    fn push_overflow_reports_no_buffer_space() {
        let mut nb = NBuf::init(4);
        assert_eq!(nb.push(b"abcde"), Err(NoBufferSpace));
        // Buffer is left usable afterwards.
        assert!(nb.push(b"abcd").is_ok());
    }

    #[tokio::test]
    async fn fill_reports_eof() {
        let mut nb = NBuf::init(16);
        let mut src = Cursor::new(Vec::new());
        let eof = nb.fill(&mut src).await.unwrap();
        assert!(eof);
    }

    #[test]
    fn copy_transfers_and_empties_source() {
        let mut dst = NBuf::init(16);
        let mut src = NBuf::init(16);
        src.push(b"hello\n").unwrap();

        NBuf::copy(&mut dst, &mut src);

        assert_eq!(dst.get_msg().unwrap(), Bytes::from_static(b"hello"));
        assert!(src.is_empty());
    }
}
