// src/conn.rs
//! Per-connection HTTP state machine.
//!
//! The reactor thread calls [`Connection::read`] and [`Connection::write`];
//! a worker calls [`Connection::process`]. Oneshot registration guarantees
//! the two never overlap for one connection, and the table's slot mutex
//! makes that hand-off visible across threads.

use crate::buffer::Buffer;
use crate::handler::Handler;
use crate::http::{Request, ResponseIntent, Status, Version, mime_for};
use crate::mapped::{MappedFile, map_resource};
use crate::parser::{ParseStatus, RequestParser};
use crate::syscalls;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Socket drained; carries the bytes read this round.
    Open(usize),
    /// The peer closed its side.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Request incomplete: re-arm for reading.
    NeedMore,
    /// A response is staged: re-arm for writing.
    Respond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Socket buffer full: re-arm for writing.
    Pending,
    /// Response sent and the client asked to keep the connection.
    KeepAlive,
    /// Response sent; close the connection.
    Close,
}

/// Staged response body. The status line and headers always sit in the write
/// buffer; an in-memory body follows them there, a file body stays mapped.
#[derive(Debug)]
enum Outgoing {
    Idle,
    Inline,
    File { map: MappedFile, sent: usize },
}

#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    peer: Option<SocketAddr>,
    generation: u64,
    read_buf: Buffer,
    write_buf: Buffer,
    parser: RequestParser,
    outgoing: Outgoing,
    keep_alive: bool,
    max_request_bytes: usize,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            fd: -1,
            peer: None,
            generation: 0,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            parser: RequestParser::new(),
            outgoing: Outgoing::Idle,
            keep_alive: false,
            max_request_bytes: usize::MAX,
        }
    }
}

impl Connection {
    /// Take over a freshly accepted socket. Buffers are reused from the
    /// previous occupant of this slot.
    pub fn init(&mut self, fd: RawFd, peer: Option<SocketAddr>, max_request_bytes: usize) -> u64 {
        self.fd = fd;
        self.peer = peer;
        self.generation = self.generation.wrapping_add(1);
        if self.read_buf.capacity() == 0 {
            self.read_buf = Buffer::new();
            self.write_buf = Buffer::new();
        }
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.parser.reset();
        self.outgoing = Outgoing::Idle;
        self.keep_alive = false;
        self.max_request_bytes = max_request_bytes;
        self.generation
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bumped on every `init`, so work queued for an earlier client of the
    /// same descriptor can be recognised and dropped.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// Bytes of a following request already buffered after a response completed.
    pub fn has_buffered_input(&self) -> bool {
        self.read_buf.readable_bytes() > 0
    }

    /// Close the socket and release the response. Returns whether it was open.
    pub fn close(&mut self) -> bool {
        if self.fd < 0 {
            return false;
        }
        syscalls::close_fd(self.fd);
        self.fd = -1;
        self.peer = None;
        self.outgoing = Outgoing::Idle;
        self.parser.reset();
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        true
    }

    /// Drain the socket until it would block.
    pub fn read(&mut self) -> io::Result<ReadStatus> {
        let mut total = 0;
        loop {
            // Leave the rest in the socket; process() answers 400 first.
            if self.read_buf.readable_bytes() > self.max_request_bytes {
                return Ok(ReadStatus::Open(total));
            }
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open(total)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse what has been read and, once a request is complete, run the
    /// handler and stage the response.
    pub fn process(&mut self, handler: &dyn Handler) -> Progress {
        if !matches!(self.outgoing, Outgoing::Idle) {
            return Progress::Respond;
        }

        match self.parser.parse(&mut self.read_buf) {
            ParseStatus::Incomplete => {
                let oversized = self.read_buf.readable_bytes() > self.max_request_bytes
                    || self.parser.content_length() > self.max_request_bytes;
                if !oversized {
                    return Progress::NeedMore;
                }
                debug!(fd = self.fd, "request exceeds size limit");
                let version = self.parser.version();
                self.keep_alive = false;
                self.read_buf.retrieve_all();
                self.parser.reset();
                self.stage(ResponseIntent::error(Status::BadRequest), version);
            }
            ParseStatus::Malformed => {
                debug!(fd = self.fd, "malformed request");
                let version = self.parser.version();
                self.keep_alive = self.parser.keep_alive();
                self.read_buf.retrieve_all();
                self.parser.reset();
                self.stage(ResponseIntent::error(Status::BadRequest), version);
            }
            ParseStatus::Complete => {
                let version = self.parser.version();
                self.keep_alive = self.parser.keep_alive();
                let intent = match self.parser.request(&self.read_buf) {
                    Some(req) => {
                        debug!(fd = self.fd, method = req.method.as_str(), path = req.path, "dispatch");
                        call_handler(handler, &req)
                    }
                    None => ResponseIntent::error(Status::InternalError),
                };
                self.parser.finish(&mut self.read_buf);
                self.stage(intent, version);
            }
        }
        Progress::Respond
    }

    /// Turn an intent into a status line, headers and a body.
    fn stage(&mut self, intent: ResponseIntent, version: Version) {
        let ResponseIntent {
            mut status,
            file,
            body,
            mut content_type,
            mut download,
        } = intent;

        let mut inline = None;
        let mut mapped = None;
        let mut filename = None;
        match file {
            Some(path) => match map_resource(&path) {
                Ok(map) => {
                    if content_type.is_none() {
                        content_type = Some(mime_for(&path));
                    }
                    filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
                    mapped = Some(map);
                }
                Err(err) => {
                    debug!(path = %path.display(), code = err.code(), "file not served");
                    status = err;
                    content_type = None;
                    download = false;
                    inline = Some(err.error_body());
                }
            },
            None => {
                inline = Some(body.unwrap_or_else(|| {
                    if status.is_success() {
                        Vec::new()
                    } else {
                        status.error_body()
                    }
                }));
            }
        }

        let content_length = match (&inline, &mapped) {
            (Some(b), _) => b.len(),
            (None, Some(m)) => m.len(),
            (None, None) => 0,
        };

        let mut head = format!("{} {} {}\r\n", version.as_str(), status.code(), status.title());
        if download {
            match &filename {
                Some(name) => head.push_str(&format!(
                    "Content-Disposition: attachment; filename=\"{}\"\r\n",
                    name.replace('"', "")
                )),
                None => head.push_str("Content-Disposition: attachment\r\n"),
            }
        }
        if let Some(ct) = &content_type {
            head.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        head.push_str(&format!("Content-Length: {}\r\n", content_length));
        head.push_str(if self.keep_alive {
            "Connection: keep-alive\r\n\r\n"
        } else {
            "Connection: close\r\n\r\n"
        });

        self.write_buf.retrieve_all();
        self.write_buf.append(head.as_bytes());
        self.outgoing = match (inline, mapped) {
            (Some(body), _) => {
                self.write_buf.append(&body);
                Outgoing::Inline
            }
            (None, Some(map)) => Outgoing::File { map, sent: 0 },
            (None, None) => Outgoing::Inline,
        };
    }

    /// Send as much of the staged response as the socket takes.
    ///
    /// Returns the outcome and the bytes written by this call.
    pub fn write(&mut self) -> io::Result<(WriteStatus, usize)> {
        let mut written = 0;
        loop {
            let (head_len, n) = {
                let head = self.write_buf.peek();
                let tail: &[u8] = match &self.outgoing {
                    Outgoing::File { map, sent } => &map.as_slice()[*sent..],
                    _ => &[],
                };
                if head.is_empty() && tail.is_empty() {
                    break;
                }
                match syscalls::writev_nonblocking(self.fd, &[head, tail]) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes")),
                    Ok(n) => (head.len(), n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok((WriteStatus::Pending, written));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            written += n;
            if n >= head_len {
                self.write_buf.retrieve_all();
                if let Outgoing::File { sent, .. } = &mut self.outgoing {
                    *sent += n - head_len;
                }
            } else {
                self.write_buf.retrieve(n);
            }
        }

        // Drops any mapping.
        self.outgoing = Outgoing::Idle;
        if self.keep_alive {
            Ok((WriteStatus::KeepAlive, written))
        } else {
            Ok((WriteStatus::Close, written))
        }
    }
}

#[cfg(feature = "catch-panic")]
fn call_handler(handler: &dyn Handler, req: &Request<'_>) -> ResponseIntent {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.handle(req))) {
        Ok(intent) => intent,
        Err(_) => {
            error!(path = req.path, "handler panicked");
            ResponseIntent::error(Status::InternalError)
        }
    }
}

#[cfg(not(feature = "catch-panic"))]
fn call_handler(handler: &dyn Handler, req: &Request<'_>) -> ResponseIntent {
    handler.handle(req)
}
