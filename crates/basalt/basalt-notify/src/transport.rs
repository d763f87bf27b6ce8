//! Byte-stream seam between the state machines and the sockets.
//!
//! The machines only need "send some bytes" and "receive some bytes" with
//! nonblocking semantics: `ErrorKind::WouldBlock` means "not now, wait for
//! the next readiness event". Anything that is `Read + Write` qualifies, which
//! covers nonblocking `UnixStream`s as well as scripted test doubles.

use std::io::{self, Read, Write};

pub trait Transport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + Write> Transport for T {
    #[inline]
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    #[inline]
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}
