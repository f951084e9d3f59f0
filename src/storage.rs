//! Shared append-only log backed by a flat file.
//!
//! Every operation opens the file, does its work and closes it again, so the
//! file on disk is always the source of truth. A single mutex serializes all
//! access:
//! - appends never interleave with each other
//! - a read never observes a partially written append
//! - a worker can hold the lock across append + read-all via [`LogGuard`]

use crate::error::LogError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

/// Chunk size used when streaming the log to a sink
const READ_CHUNK_SIZE: usize = 1024;

/// Thread-safe append-only log
#[derive(Debug)]
pub struct SharedLog {
    /// Location of the data file
    path: PathBuf,
    /// Serializes every access to the file
    lock: Mutex<()>,
}

impl SharedLog {
    /// Create a handle for the log at `path`. The file is not touched.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire exclusive access to the log.
    ///
    /// The guarded state is `()`, so a poisoned lock is simply recovered.
    pub fn lock(&self) -> LogGuard<'_> {
        LogGuard {
            log: self,
            _guard: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Append one record under the lock.
    pub fn append(&self, bytes: &[u8]) -> Result<(), LogError> {
        self.lock().append(bytes)
    }

    /// Stream the whole log to `sink` under the lock.
    #[cfg(test)]
    pub fn read_all<W: Write>(&self, sink: &mut W) -> Result<u64, LogError> {
        self.lock().read_all(sink)
    }

    /// Recreate the data file empty, discarding anything a previous run left.
    pub fn reset(&self) -> io::Result<()> {
        let _guard = self.lock();
        remove_if_exists(&self.path)?;
        File::create(&self.path)?;
        info!(path = %self.path.display(), "Shared log reset");
        Ok(())
    }

    /// Delete the data file. Missing files are not an error.
    pub fn remove(&self) -> io::Result<()> {
        let _guard = self.lock();
        remove_if_exists(&self.path)?;
        debug!(path = %self.path.display(), "Shared log removed");
        Ok(())
    }
}

/// Exclusive access to a [`SharedLog`].
///
/// Operations issued through one guard form a single critical section.
pub struct LogGuard<'a> {
    log: &'a SharedLog,
    _guard: MutexGuard<'a, ()>,
}

impl LogGuard<'_> {
    /// Append `bytes` to the data file, creating it if needed.
    ///
    /// `write_all` keeps writing after short writes and retries on
    /// `Interrupted`; any other error aborts the append.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log.path)
            .map_err(LogError::Store)?;

        file.write_all(bytes).map_err(LogError::Store)?;
        trace!(len = bytes.len(), "Appended record");
        Ok(())
    }

    /// Stream the data file to `sink` in bounded chunks.
    ///
    /// Returns the number of bytes sent.
    pub fn read_all<W: Write>(&mut self, sink: &mut W) -> Result<u64, LogError> {
        let mut file = File::open(&self.log.path).map_err(LogError::Store)?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LogError::Store(e)),
            };
            sink.write_all(&chunk[..n]).map_err(LogError::Sink)?;
            total += n as u64;
        }

        sink.flush().map_err(LogError::Sink)?;
        Ok(total)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn temp_log() -> (tempfile::TempDir, SharedLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::new(dir.path().join("data"));
        log.reset().unwrap();
        (dir, log)
    }

    fn contents(log: &SharedLog) -> Vec<u8> {
        let mut out = Vec::new();
        log.read_all(&mut out).unwrap();
        out
    }

    /// Sink that accepts a limited number of bytes before failing.
    struct BrokenSink {
        remaining: usize,
    }

    impl Write for BrokenSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_append_and_read() {
        let (_dir, log) = temp_log();

        log.append(b"hello\n").unwrap();
        log.append(b"world\n").unwrap();

        assert_eq!(contents(&log), b"hello\nworld\n");
    }

    #[test]
    fn test_read_is_idempotent() {
        let (_dir, log) = temp_log();
        log.append(b"one\n").unwrap();

        let first = contents(&log);
        let second = contents(&log);
        assert_eq!(first, second);
    }

    #[test]
    fn test_read_streams_large_log() {
        let (_dir, log) = temp_log();
        let record: Vec<u8> = std::iter::repeat(b'x')
            .take(READ_CHUNK_SIZE * 3 + 17)
            .chain(std::iter::once(b'\n'))
            .collect();
        log.append(&record).unwrap();

        let mut out = Vec::new();
        let sent = log.read_all(&mut out).unwrap();
        assert_eq!(sent, record.len() as u64);
        assert_eq!(out, record);
    }

    #[test]
    fn test_reset_truncates() {
        let (_dir, log) = temp_log();
        log.append(b"stale\n").unwrap();

        log.reset().unwrap();
        assert!(contents(&log).is_empty());
    }

    #[test]
    fn test_remove() {
        let (_dir, log) = temp_log();
        log.append(b"x\n").unwrap();

        log.remove().unwrap();
        assert!(!log.path().exists());

        // Removing twice is fine
        log.remove().unwrap();
    }

    #[test]
    fn test_missing_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = SharedLog::new(dir.path().join("never-created"));

        let mut out = Vec::new();
        assert!(matches!(log.read_all(&mut out), Err(LogError::Store(_))));
    }

    #[test]
    fn test_sink_failure_is_sink_error() {
        let (_dir, log) = temp_log();
        log.append(b"payload that will not fit\n").unwrap();

        let mut sink = BrokenSink { remaining: 4 };
        assert!(matches!(log.read_all(&mut sink), Err(LogError::Sink(_))));

        // The log itself is unaffected
        assert_eq!(contents(&log), b"payload that will not fit\n");
    }

    #[test]
    fn test_guard_sees_own_append() {
        let (_dir, log) = temp_log();
        log.append(b"before\n").unwrap();

        let mut guard = log.lock();
        guard.append(b"mine\n").unwrap();
        let mut out = Vec::new();
        guard.read_all(&mut out).unwrap();
        drop(guard);

        assert_eq!(out, b"before\nmine\n");
    }

    #[test]
    fn test_concurrent_appends_never_interleave() {
        let (_dir, log) = temp_log();
        let log = Arc::new(log);
        let threads = 8;
        let per_thread = 50;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    // Long records make torn writes visible if locking fails
                    let record = format!("{}\n", t.to_string().repeat(2000));
                    for _ in 0..per_thread {
                        log.append(record.as_bytes()).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let data = contents(&log);
        let lines: Vec<&[u8]> = data
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .collect();

        assert_eq!(lines.len(), threads * per_thread);
        for line in lines {
            assert_eq!(line.len(), 2000);
            assert!(line.iter().all(|&b| b == line[0]));
        }
    }
}
