//! Readiness polling over `poll(2)`.
//!
//! The descriptor set is rebuilt every loop turn: `register` hands back a
//! token (the slot index) that is valid until the next `clear`.

use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

pub const READ: i16 = libc::POLLIN;
pub const WRITE: i16 = libc::POLLOUT;
/// Errors and hang-ups are always reported.
pub const NONE: i16 = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(i16);

impl Readiness {
    pub fn readable(self) -> bool {
        self.0 & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }

    pub fn writable(self) -> bool {
        self.0 & (libc::POLLOUT | libc::POLLERR) != 0
    }

    pub fn hangup(self) -> bool {
        self.0 & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
    }
}

#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn register<F: AsRawFd>(&mut self, fd: &F, interest: i16) -> usize {
        self.fds.push(libc::pollfd {
            fd: fd.as_raw_fd(),
            events: interest,
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Waits for readiness. An interrupted wait reports nothing ready.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `fds` is an initialized array of exactly `len` pollfd
        // entries that stays borrowed for the whole call.
        let rc = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        Ok(rc as usize)
    }

    pub fn readiness(&self, token: usize) -> Readiness {
        self.fds
            .get(token)
            .map(|p| Readiness(p.revents))
            .unwrap_or_default()
    }
}
