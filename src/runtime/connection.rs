//! Per-connection workers and the registry that tracks them.
//!
//! Each accepted socket is served by its own thread. The registry is owned
//! by the accept loop; workers only ever touch their own completion flag.

use crate::error::ConnectionError;
use crate::runtime::framing::FrameReader;
use crate::storage::SharedLog;
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A single client connection.
pub struct Connection {
    /// Remote address, for logging.
    peer: SocketAddr,
    /// Framed receive side; also used as the send side.
    reader: FrameReader<TcpStream>,
}

impl Connection {
    /// Wrap an accepted blocking stream.
    pub fn new(stream: TcpStream, peer: SocketAddr, chunk_size: usize) -> Self {
        Self {
            peer,
            reader: FrameReader::new(stream, chunk_size),
        }
    }

    /// Remote address of the client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Received bytes not yet terminated by a delimiter.
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    /// Serve records until the peer closes the connection.
    ///
    /// For every record the log lock is held across the append and the
    /// read-back, so the client always sees its own write and never a
    /// partial one. Returns the number of records handled.
    pub fn serve(&mut self, log: &SharedLog) -> Result<u64, ConnectionError> {
        let mut records = 0u64;

        while let Some(record) = self.reader.next_record().map_err(ConnectionError::Receive)? {
            let mut sink = self.reader.get_ref();
            let mut guard = log.lock();
            guard.append(&record)?;
            let sent = guard.read_all(&mut sink)?;
            drop(guard);

            records += 1;
            debug!(peer = %self.peer, len = record.len(), sent, "Record appended");
        }

        Ok(records)
    }
}

/// Sets the completion flag when dropped, including on panic.
struct CompletionGuard(Arc<AtomicBool>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A spawned worker as seen by the registry.
pub struct RegistryEntry {
    peer: SocketAddr,
    handle: JoinHandle<()>,
    done: Arc<AtomicBool>,
    /// Second handle on the socket, used to force a blocked read to return.
    stream: TcpStream,
}

impl RegistryEntry {
    /// Whether the worker has finished and can be joined without blocking.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Remote address of the worker's client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn join(self) {
        if self.handle.join().is_err() {
            warn!(peer = %self.peer, "Connection worker panicked");
        }
    }
}

/// Spawn a worker thread serving `stream`.
///
/// The stream is switched to blocking mode; the worker blocks in `read`
/// until data arrives, the peer closes, or the registry shuts it down.
pub fn spawn_worker(
    stream: TcpStream,
    peer: SocketAddr,
    log: Arc<SharedLog>,
    chunk_size: usize,
) -> io::Result<RegistryEntry> {
    stream.set_nonblocking(false)?;
    let control = stream.try_clone()?;
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);

    let handle = thread::Builder::new()
        .name(format!("conn-{peer}"))
        .spawn(move || {
            let _guard = CompletionGuard(flag);
            let mut conn = Connection::new(stream, peer, chunk_size);

            match conn.serve(&log) {
                Ok(records) => {
                    info!(peer = %conn.peer().ip(), records, "Closed connection");
                }
                Err(e) => {
                    warn!(
                        peer = %conn.peer().ip(),
                        pending = conn.buffered(),
                        error = %e,
                        "Connection torn down"
                    );
                }
            }
        })?;

    Ok(RegistryEntry {
        peer,
        handle,
        done,
        stream: control,
    })
}

/// Registry of live workers using slab allocation.
///
/// Only the accept loop mutates it, so no lock is needed.
#[derive(Default)]
pub struct ConnectionRegistry {
    workers: Slab<RegistryEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly spawned worker.
    pub fn register(&mut self, entry: RegistryEntry) -> usize {
        self.workers.insert(entry)
    }

    /// Join and drop every worker that has signalled completion.
    ///
    /// Returns the number of workers reaped.
    pub fn reap(&mut self) -> usize {
        let finished: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.is_done())
            .map(|(id, _)| id)
            .collect();

        for &id in &finished {
            let entry = self.workers.remove(id);
            debug!(peer = %entry.peer(), "Reaped connection worker");
            entry.join();
        }

        finished.len()
    }

    /// Unblock, join and drain every worker.
    ///
    /// Shutting the socket down makes a worker blocked in `read` see end of
    /// input, so the join cannot hang on an idle client.
    pub fn shutdown_all(&mut self) -> usize {
        for (_, entry) in self.workers.iter() {
            if let Err(e) = entry.stream.shutdown(Shutdown::Both) {
                // Peer may already be gone
                debug!(peer = %entry.peer(), error = %e, "Socket shutdown failed");
            }
        }

        let count = self.workers.len();
        for entry in self.workers.drain() {
            entry.join();
        }
        count
    }

    /// Number of tracked workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Check if no workers are tracked.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
