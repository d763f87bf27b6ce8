//! Local admin socket carrying configuration requests.
//!
//! ```text
//! request:  METHOD SP PATH SP BODY-LEN LF BODY
//! response: STATUS SP BODY-LEN LF BODY
//! ```
//!
//! Requests on one connection are answered in order. The server closes the
//! connection after the client shuts down its side, or after a malformed
//! request has been answered with 400.

use basalt_engine::{Method, Response, Status};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Largest accepted request body.
pub const MAX_BODY: usize = 1 << 20;
/// Longest accepted request line.
const MAX_LINE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("request body of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("malformed response")]
    BadResponse,

    #[error("admin socket i/o failed")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRequest {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the bytes it used, or `None` while more input
/// is needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(AdminRequest, usize)>, AdminError> {
    let Some(eol) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_LINE {
            return Err(AdminError::BadRequestLine);
        }
        return Ok(None);
    };

    let line = std::str::from_utf8(&buf[..eol]).map_err(|_| AdminError::BadRequestLine)?;
    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(path), Some(len), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AdminError::BadRequestLine);
    };
    let len: usize = len.parse().map_err(|_| AdminError::BadRequestLine)?;
    if len > MAX_BODY {
        return Err(AdminError::TooLarge(len));
    }

    let end = eol + 1 + len;
    if buf.len() < end {
        return Ok(None);
    }
    let req = AdminRequest {
        method: Method::parse(method),
        path: path.to_owned(),
        body: buf[eol + 1..end].to_vec(),
    };
    Ok(Some((req, end)))
}

pub fn encode_request(method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!("{method} {path} {}\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn encode_response(resp: &Response) -> Vec<u8> {
    let mut out = format!("{} {}\n", resp.status.code(), resp.body.len()).into_bytes();
    out.extend_from_slice(&resp.body);
    out
}

/// Blocking one-shot client: sends a request and waits for its response.
pub fn request(
    socket: impl AsRef<Path>,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<(u16, Vec<u8>), AdminError> {
    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(&encode_request(method, path, body))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_ascii_whitespace();
    let (Some(code), Some(len)) = (parts.next(), parts.next()) else {
        return Err(AdminError::BadResponse);
    };
    let code: u16 = code.parse().map_err(|_| AdminError::BadResponse)?;
    let len: usize = len.parse().map_err(|_| AdminError::BadResponse)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok((code, body))
}

/// Server side of one admin connection.
pub(crate) struct AdminConn {
    stream: UnixStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    written: usize,
    /// No more requests will be read.
    closing: bool,
}

impl AdminConn {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            written: 0,
            closing: false,
        }
    }

    pub(crate) fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.written < self.outbuf.len()
    }

    /// Nothing left to read or write.
    pub(crate) fn finished(&self) -> bool {
        self.closing && !self.wants_write()
    }

    /// Reads what is available and returns every complete request.
    pub(crate) fn on_readable(&mut self) -> Result<Vec<AdminRequest>, AdminError> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closing = true;
                    break;
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut reqs = Vec::new();
        while let Some((req, used)) = parse_request(&self.inbuf)? {
            self.inbuf.drain(..used);
            reqs.push(req);
        }
        Ok(reqs)
    }

    pub(crate) fn respond(&mut self, resp: &Response) {
        self.outbuf.extend_from_slice(&encode_response(resp));
    }

    /// Answers 400 and stops reading.
    pub(crate) fn reject(&mut self, e: &AdminError) {
        self.respond(&Response {
            status: Status::BadRequest,
            body: format!("{{\"error\":\"{e}\"}}\n").into_bytes(),
        });
        self.inbuf.clear();
        self.closing = true;
    }

    pub(crate) fn on_writable(&mut self) -> io::Result<()> {
        while self.wants_write() {
            match self.stream.write(&self.outbuf[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.outbuf.clear();
        self.written = 0;
        Ok(())
    }
}
