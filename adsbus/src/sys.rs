//! The handful of raw libc calls the bus needs: signals delivered through a
//! pollable `signalfd`, process-group kill, and file status flags.
//!
//! Signals are blocked in the calling thread and threads inherit the mask, so
//! install [`SignalFd`] before spawning any.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::c_int;

/// Signals the bus reacts to.
pub const HANDLED: [c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGCHLD];

#[derive(Debug)]
pub struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    /// Block `signals` in this thread and route them to a new non-blocking fd.
    pub fn install(signals: &[c_int]) -> io::Result<Self> {
        // SAFETY: sigset_t is plain data; sigemptyset initializes it.
        let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            for &sig in signals {
                libc::sigaddset(&mut mask, sig);
            }
        }
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: signalfd returned a fresh descriptor that nothing else owns.
        Ok(SignalFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Drain every pending signal number.
    pub fn read_pending(&self) -> io::Result<Vec<c_int>> {
        let mut pending = Vec::new();
        let size = mem::size_of::<libc::signalfd_siginfo>();
        loop {
            // SAFETY: signalfd_siginfo is plain data and `read` writes at most `size` bytes.
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    size,
                )
            };
            if n == size as isize {
                pending.push(info.ssi_signo as c_int);
                continue;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    _ => return Err(err),
                }
            }
            break;
        }
        Ok(pending)
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Send `signal` to every process in the group led by `pgid`.
pub fn kill_group(pgid: u32, signal: c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we borrow; no pointers involved.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// File status flags captured from a descriptor and written back on drop.
/// The descriptor must outlive this value.
#[derive(Debug)]
pub struct SavedFlags {
    fd: RawFd,
    flags: c_int,
}

impl SavedFlags {
    pub fn save(fd: RawFd) -> io::Result<Self> {
        // SAFETY: F_GETFL takes no pointer argument.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SavedFlags { fd, flags })
    }
}

impl Drop for SavedFlags {
    fn drop(&mut self) {
        // SAFETY: F_SETFL takes an integer argument.
        unsafe { libc::fcntl(self.fd, libc::F_SETFL, self.flags) };
    }
}
