//! TCP server supervising the accept loop, workers and heartbeat.
//!
//! Lifecycle:
//!
//! ```text
//! Init -> Bound -> (Daemonized) -> Listening -> Accepting -> ShuttingDown -> Terminated
//! ```
//!
//! The accept loop polls the listener together with a waker owned by the
//! [`Shutdown`] token, so a termination signal interrupts it immediately.
//! Connections are served by blocking worker threads tracked in the
//! [`ConnectionRegistry`]; shutdown forces their sockets closed before
//! joining them.

use crate::config::Config;
use crate::daemon;
use crate::error::{ServerError, ServerResult};
use crate::heartbeat::Heartbeat;
use crate::runtime::{spawn_worker, ConnectionRegistry};
use crate::shutdown::{ignore_sigpipe, Shutdown, SignalListener};
use crate::storage::SharedLog;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Pending connection queue length
const LISTEN_BACKLOG: i32 = 10;

/// Delay before retrying `accept` after a resource-exhaustion error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Bound,
    Daemonized,
    Listening,
    Accepting,
    ShuttingDown,
    Terminated,
}

/// Server instance
///
/// Dropping the server deletes the shared log, whether or not it ran.
pub struct Server {
    config: Config,
    state: ServerState,
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    shutdown: Shutdown,
    log: Arc<SharedLog>,
    registry: ConnectionRegistry,
}

impl Server {
    /// Bind the listener, reset the shared log and, if configured, detach
    /// from the terminal.
    ///
    /// Daemonizing happens here because it must follow the bind and precede
    /// every thread the server starts.
    pub fn bind(config: Config) -> ServerResult<Self> {
        let mut state = ServerState::Init;

        let addr: SocketAddr =
            config
                .listen
                .parse()
                .map_err(|source| ServerError::InvalidAddress {
                    addr: config.listen.clone(),
                    source,
                })?;

        let listener =
            create_listener(addr).map_err(|source| ServerError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;
        transition(&mut state, ServerState::Bound);

        let log = Arc::new(SharedLog::new(&config.data_file));
        log.reset()?;

        let setup = || -> ServerResult<(Poll, Waker)> {
            if config.daemon {
                daemon::daemonize(listener.as_raw_fd()).map_err(ServerError::Daemonize)?;
            }
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            Ok((poll, waker))
        };
        let (poll, waker) = match setup() {
            Ok(parts) => parts,
            Err(e) => {
                let _ = log.remove();
                return Err(e);
            }
        };
        if config.daemon {
            transition(&mut state, ServerState::Daemonized);
        }

        Ok(Server {
            config,
            state,
            listener,
            local_addr,
            poll,
            shutdown: Shutdown::new(waker),
            log,
            registry: ConnectionRegistry::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops [`Server::run`] when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Current lifecycle state
    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Serve connections until shutdown is triggered, then tear everything
    /// down. The shared log is deleted when the server is dropped on return.
    pub fn run(mut self) -> ServerResult<()> {
        ignore_sigpipe();
        let signals =
            SignalListener::install(self.shutdown.clone()).map_err(ServerError::Signal)?;

        let heartbeat = if self.config.heartbeat_interval.is_zero() {
            None
        } else {
            match Heartbeat::spawn(Arc::clone(&self.log), self.config.heartbeat_interval) {
                Ok(heartbeat) => Some(heartbeat),
                Err(e) => {
                    signals.close();
                    return Err(e.into());
                }
            }
        };

        info!(
            address = %self.local_addr,
            data_file = %self.log.path().display(),
            "Server listening"
        );

        let result = self.accept_loop();
        if let Err(ref e) = result {
            error!(error = %e, "Accept loop failed");
        }

        transition(&mut self.state, ServerState::ShuttingDown);
        let drained = self.registry.shutdown_all();
        debug_assert!(self.registry.is_empty());
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
        signals.close();

        transition(&mut self.state, ServerState::Terminated);
        info!(drained, "Server stopped");

        result.map_err(ServerError::from)
    }

    fn accept_loop(&mut self) -> io::Result<()> {
        let fd = self.listener.as_raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;
        transition(&mut self.state, ServerState::Listening);

        let mut events = Events::with_capacity(64);
        transition(&mut self.state, ServerState::Accepting);

        // Set while the backlog could not be drained; no new edge will be
        // reported for the connections still queued, so poll with a timeout
        let mut retry = false;

        while !self.shutdown.is_triggered() {
            let timeout = retry.then_some(ACCEPT_RETRY_DELAY);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let readable = events.iter().any(|e| e.token() == LISTENER_TOKEN);
            if readable || retry {
                retry = !self.accept_pending();
            }
        }

        self.poll
            .registry()
            .deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    /// Drain the listener's backlog; readiness is edge-triggered.
    ///
    /// Returns `false` when an error stopped the drain early and queued
    /// connections may remain.
    fn accept_pending(&mut self) -> bool {
        loop {
            if self.shutdown.is_triggered() {
                return true;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer.ip(), "Accepted connection");

                    match spawn_worker(stream, peer, Arc::clone(&self.log), self.config.chunk_size)
                    {
                        Ok(entry) => {
                            self.registry.register(entry);
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Failed to spawn worker"),
                    }

                    let reaped = self.registry.reap();
                    debug!(reaped, live = self.registry.len(), "Reaped workers");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_connection_error(e) => {
                    debug!(error = %e, "Connection failed before accept");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection, retrying");
                    return false;
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.log.remove() {
            warn!(error = %e, "Failed to delete shared log");
        }
    }
}

/// Accept errors that concern only the one queued connection.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

fn transition(state: &mut ServerState, next: ServerState) {
    debug!(from = ?*state, to = ?next, "Server state");
    *state = next;
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
