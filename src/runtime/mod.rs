//! Blocking per-connection runtime.
//!
//! - `framing`: newline framing with a growable receive buffer
//! - `connection`: worker threads and the registry that reaps them

mod connection;
mod framing;

pub(crate) use connection::{spawn_worker, ConnectionRegistry};
