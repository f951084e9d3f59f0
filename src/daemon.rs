//! Detach from the controlling terminal.
//!
//! Must run while the process is still single-threaded: `fork` only
//! carries the calling thread into the child.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// Upper bound used when `sysconf` cannot report the descriptor limit.
const FALLBACK_OPEN_MAX: RawFd = 1024;

/// Classic double-fork daemonization.
///
/// The original parent and the intermediate session leader exit; the
/// grandchild returns from this function with no controlling terminal,
/// `/` as working directory, a zero umask, standard streams on
/// `/dev/null`, and every other descriptor closed except `keep`.
pub fn daemonize(keep: RawFd) -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: plain syscall, no memory is shared with the caller.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: SIG_IGN installs no handler code.
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork: the session leader exits so the daemon can never
    // reacquire a terminal.
    fork_and_exit_parent()?;

    // SAFETY: umask cannot fail.
    unsafe {
        libc::umask(0);
    }
    std::env::set_current_dir("/")?;

    redirect_std_streams()?;
    close_inherited(keep);
    Ok(())
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: the process is single-threaded here, so the child inherits a
    // consistent address space.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        // SAFETY: `_exit` skips destructors and stdio flushing, which
        // belong to the child now.
        _ => unsafe { libc::_exit(0) },
    }
}

fn redirect_std_streams() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let null_fd = null.as_raw_fd();

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(null_fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Highest descriptor number worth closing.
fn open_max() -> RawFd {
    // SAFETY: sysconf has no memory-safety preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max < 0 {
        FALLBACK_OPEN_MAX
    } else {
        RawFd::try_from(max).unwrap_or(RawFd::MAX)
    }
}

/// Descriptors currently open, as listed by procfs.
fn listed_fds() -> Option<Vec<RawFd>> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
    )
}

fn close_inherited(keep: RawFd) {
    // procfs avoids walking a descriptor limit that may be in the millions
    let candidates: Vec<RawFd> = match listed_fds() {
        Some(fds) => fds,
        None => ((libc::STDERR_FILENO + 1)..open_max()).collect(),
    };

    for fd in candidates {
        if fd > libc::STDERR_FILENO && fd != keep {
            // SAFETY: nothing in this process owns these descriptors any
            // more; EBADF for stale entries is ignored.
            unsafe {
                libc::close(fd);
            }
        }
    }
}
