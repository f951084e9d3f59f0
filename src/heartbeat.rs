//! Periodic timestamp records.
//!
//! A dedicated thread appends `timestamp:<local time>\n` to the shared log
//! on a fixed schedule measured from when the emitter starts. It takes the
//! same lock as connection workers and holds nothing else, so it can wait
//! behind a worker but never deadlock with one.

use crate::storage::SharedLog;
use chrono::{DateTime, Local};
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// RFC 2822 style layout, e.g. `Mon, 19 Oct 2026 14:03:07 +0200`.
pub const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %T %z";

/// Prefix of every heartbeat record.
pub const TIMESTAMP_PREFIX: &str = "timestamp:";

/// Build the record appended for `now`.
pub fn timestamp_record(now: DateTime<Local>) -> String {
    format!("{TIMESTAMP_PREFIX}{}\n", now.format(TIMESTAMP_FORMAT))
}

/// Handle on a running heartbeat thread.
pub struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start appending a timestamp record every `interval`.
    pub fn spawn(log: Arc<SharedLog>, interval: Duration) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut ticks: u32 = 0;

                loop {
                    ticks += 1;
                    let Some(offset) = interval.checked_mul(ticks) else {
                        break;
                    };
                    let wait = (start + offset).saturating_duration_since(Instant::now());

                    match stopped.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let record = timestamp_record(Local::now());
                    match log.append(record.as_bytes()) {
                        Ok(()) => debug!(record = record.trim_end(), "Heartbeat"),
                        Err(e) => warn!(error = %e, "Failed to append heartbeat"),
                    }
                }
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "Heartbeat started");
        Ok(Self { stop, handle })
    }

    /// Cancel the schedule and wait for the thread to exit.
    pub fn stop(self) {
        // Send fails only if the thread is already gone
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Heartbeat thread panicked");
        }
        debug!("Heartbeat stopped");
    }
}
