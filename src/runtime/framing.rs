//! Newline framing over a blocking byte source.
//!
//! ## Growth Policy
//!
//! The receive buffer starts at `chunk_size` bytes of logical capacity. Each
//! read asks for at most `chunk_size` bytes of the free space; once the
//! buffered bytes reach the capacity it doubles (see [`grow_capacity`]).
//! Bounding the read keeps the zero-fill per read constant, so a large record
//! arriving in small segments costs time linear in its length. Capacity resets to `chunk_size` after a
//! record is handed out, so one huge record does not pin memory for the
//! lifetime of the connection.
//!
//! ## Pipelined Records
//!
//! Bytes that follow the delimiter in the same read are kept and become the
//! start of the next record. A buffer that already holds a complete record is
//! drained before the source is read again.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read};
use tracing::{debug, trace};

/// Record terminator.
pub const DELIMITER: u8 = b'\n';

/// Next logical buffer capacity when `current` is full.
///
/// Returns `None` when doubling would overflow.
pub fn grow_capacity(current: usize) -> Option<usize> {
    current.checked_mul(2)
}

/// Splits a byte stream into newline-terminated records.
pub struct FrameReader<R> {
    source: R,
    buf: BytesMut,
    /// Logical capacity; the buffer is filled up to this many bytes.
    capacity: usize,
    chunk_size: usize,
    /// Prefix of `buf` already known to contain no delimiter.
    scanned: usize,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader whose buffer starts at `chunk_size` bytes.
    pub fn new(source: R, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            source,
            buf: BytesMut::with_capacity(chunk_size),
            capacity: chunk_size,
            chunk_size,
            scanned: 0,
        }
    }

    /// Read until one complete record (including its delimiter) is available.
    ///
    /// Returns `Ok(None)` when the source reaches end of input; a trailing
    /// partial record is discarded. `Interrupted` reads are retried, any other
    /// read error is returned. Running out of addressable capacity yields
    /// `ErrorKind::OutOfMemory`.
    pub fn next_record(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(pos) = find_delimiter(&self.buf[self.scanned..]) {
                let end = self.scanned + pos + 1;
                let record = self.buf.split_to(end).freeze();
                self.scanned = 0;
                self.capacity = self.chunk_size;
                trace!(len = record.len(), carried = self.buf.len(), "Framed record");
                return Ok(Some(record));
            }
            self.scanned = self.buf.len();

            while self.buf.len() >= self.capacity {
                self.capacity = grow_capacity(self.capacity).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::OutOfMemory, "record buffer overflow")
                })?;
                trace!(capacity = self.capacity, "Grew receive buffer");
            }

            let start = self.buf.len();
            let end = start + (self.capacity - start).min(self.chunk_size);
            self.buf.resize(end, 0);

            match self.source.read(&mut self.buf[start..end]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    if !self.buf.is_empty() {
                        debug!(discarded = self.buf.len(), "Partial record at end of input");
                    }
                    self.buf.clear();
                    self.scanned = 0;
                    return Ok(None);
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        }
    }

    /// Bytes currently buffered but not yet returned as a record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Current logical buffer capacity.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Underlying source.
    pub fn get_ref(&self) -> &R {
        &self.source
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Source that hands out pre-arranged reads one at a time.
    struct ScriptedReader {
        reads: VecDeque<io::Result<Vec<u8>>>,
        /// Largest buffer offered to a single read
        max_read: usize,
        /// Total buffer space offered across all reads
        requested: usize,
    }

    impl ScriptedReader {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
                max_read: 0,
                requested: 0,
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(mut chunk)) => {
                    self.max_read = self.max_read.max(buf.len());
                    self.requested += buf.len();
                    if chunk.len() > buf.len() {
                        let rest = chunk.split_off(buf.len());
                        self.reads.push_front(Ok(rest));
                    }
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    #[test]
    fn test_single_record() {
        let mut reader = FrameReader::new(&b"hello\n"[..], 1024);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"hello\n"[..]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_record_split_across_reads() {
        let source = ScriptedReader::new(vec![Ok(b"hel".to_vec()), Ok(b"lo\n".to_vec())]);
        let mut reader = FrameReader::new(source, 1024);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"hello\n"[..]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_pipelined_records_carry_over() {
        let source = ScriptedReader::new(vec![Ok(b"one\ntwo\nthr".to_vec()), Ok(b"ee\n".to_vec())]);
        let mut reader = FrameReader::new(source, 1024);

        assert_eq!(reader.next_record().unwrap().unwrap(), &b"one\n"[..]);
        assert_eq!(reader.buffered(), 7);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"two\n"[..]);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"three\n"[..]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_partial_record_discarded_at_eof() {
        let mut reader = FrameReader::new(&b"done\nunfinished"[..], 1024);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"done\n"[..]);
        assert!(reader.next_record().unwrap().is_none());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_empty_record() {
        let mut reader = FrameReader::new(&b"\n"[..], 8);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"\n"[..]);
    }

    #[test]
    fn test_growth_captures_large_record() {
        let chunk = 16;
        let mut record = vec![b'a'; chunk * 10];
        record.push(b'\n');

        let reads = record.chunks(chunk).map(|c| Ok(c.to_vec())).collect();
        let mut reader = FrameReader::new(ScriptedReader::new(reads), chunk);

        let framed = reader.next_record().unwrap().unwrap();
        assert_eq!(framed.len(), chunk * 10 + 1);
        assert_eq!(&framed[..], &record[..]);

        // Capacity grew 16 -> 32 -> 64 -> 128 -> 256 while reads stayed chunk sized
        assert_eq!(reader.get_ref().max_read, chunk);
        // Capacity resets once the record is handed out
        assert_eq!(reader.capacity(), chunk);
    }

    #[test]
    fn test_small_segments_read_linearly() {
        let chunk = 16;
        let mut record = vec![b'q'; chunk * 1000];
        record.push(b'\n');

        // Peer trickles the record one chunk at a time
        let reads = record.chunks(chunk).map(|c| Ok(c.to_vec())).collect();
        let mut reader = FrameReader::new(ScriptedReader::new(reads), chunk);

        let framed = reader.next_record().unwrap().unwrap();
        assert_eq!(framed.len(), record.len());

        let source = reader.get_ref();
        assert!(source.max_read <= chunk);
        assert!(
            source.requested <= record.len() + chunk,
            "offered {} bytes of read space for a {} byte record",
            source.requested,
            record.len()
        );
    }

    #[test]
    fn test_grow_capacity_policy() {
        assert_eq!(grow_capacity(1024), Some(2048));
        assert_eq!(grow_capacity(1), Some(2));
        assert_eq!(grow_capacity(usize::MAX), None);
    }

    #[test]
    fn test_carry_over_larger_than_chunk() {
        let mut data = b"aaaaaaaaa\n".to_vec();
        data.extend(vec![b'b'; 12]);
        data.push(b'\n');

        // Three 4-byte reads reach the delimiter, leaving 2 carried bytes
        let mut reader = FrameReader::new(ScriptedReader::new(vec![Ok(data)]), 4);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"aaaaaaaaa\n"[..]);
        assert_eq!(reader.buffered(), 2);
        assert_eq!(reader.capacity(), 4);

        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second.len(), 13);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_interrupted_is_retried() {
        let source = ScriptedReader::new(vec![
            Ok(b"ab".to_vec()),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(b"c\n".to_vec()),
        ]);
        let mut reader = FrameReader::new(source, 1024);
        assert_eq!(reader.next_record().unwrap().unwrap(), &b"abc\n"[..]);
    }

    #[test]
    fn test_read_error_is_returned() {
        let source = ScriptedReader::new(vec![
            Ok(b"partial".to_vec()),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        ]);
        let mut reader = FrameReader::new(source, 1024);
        let err = reader.next_record().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
