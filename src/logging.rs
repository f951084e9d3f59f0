//! Logging setup.
//!
//! Foreground runs log to stderr. With a log file configured, events are
//! appended there. A daemon without a log file has no stderr, so events go
//! to the system log under the `logsock` ident.

use crate::config::Config;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once, after daemonizing.
pub fn init(config: &Config) -> io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(path) = &config.log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    } else if config.daemon {
        open_syslog();
        builder
            .with_ansi(false)
            .without_time()
            .with_writer(|| SyslogWriter)
            .init();
    } else {
        builder.init();
    }

    Ok(())
}

fn open_syslog() {
    // SAFETY: the ident is a 'static C string, as openlog requires.
    unsafe {
        libc::openlog(c"logsock".as_ptr(), libc::LOG_PID, libc::LOG_USER);
    }
}

/// Forwards each formatted event to `syslog(3)`.
struct SyslogWriter;

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let message = syslog_message(buf);
        // SAFETY: both pointers are valid NUL-terminated strings; the
        // message is passed as an argument, never as the format.
        unsafe {
            libc::syslog(libc::LOG_INFO, c"%s".as_ptr(), message.as_ptr());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One formatted event as a C string: trailing newline dropped, interior
/// NULs removed.
fn syslog_message(buf: &[u8]) -> CString {
    let text = String::from_utf8_lossy(buf);
    let bytes: Vec<u8> = text
        .trim_end_matches('\n')
        .bytes()
        .filter(|&b| b != 0)
        .collect();
    // No NULs remain
    CString::new(bytes).unwrap_or_default()
}
