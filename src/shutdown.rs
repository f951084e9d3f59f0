//! Cancellation token and termination-signal plumbing.
//!
//! SIGINT and SIGTERM are received on a dedicated thread (no work happens
//! in async-signal context) and turned into [`Shutdown::trigger`], which
//! flips a flag and wakes the accept loop's poll.

use mio::Waker;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

struct Inner {
    triggered: AtomicBool,
    waker: Waker,
}

/// Cloneable shutdown token tied to the accept loop's poll.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a token that wakes `waker` when triggered.
    pub fn new(waker: Waker) -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.waker.wake() {
            warn!(error = %e, "Failed to wake accept loop");
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }
}

/// Keep a client that disconnects mid-send from killing the process;
/// the send returns `EPIPE` instead.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no handler code and no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Thread forwarding termination signals to a [`Shutdown`] token.
pub struct SignalListener {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalListener {
    /// Register SIGINT/SIGTERM and start forwarding them to `shutdown`.
    pub fn install(shutdown: Shutdown) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "Caught signal, exiting");
                    shutdown.trigger();
                }
            })?;

        debug!("Signal handlers installed");
        Ok(Self { handle, thread })
    }

    /// Stop listening and join the thread.
    pub fn close(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            warn!("Signal thread panicked");
        }
    }
}
