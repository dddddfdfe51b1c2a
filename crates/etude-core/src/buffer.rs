// src/buffer.rs
use crate::syscalls;
use memchr::memmem;
use std::io;
use std::os::fd::RawFd;

pub const INITIAL_SIZE: usize = 1024;

/// Overflow area used by `read_fd` so one readv can drain more than the free tail.
const EXTRA_READ: usize = 65536;

/// Growable byte buffer with separate read and write cursors.
///
/// `[read_index, write_index)` holds unconsumed bytes and `[write_index, len)`
/// is free space. Consuming bytes only moves the read cursor; nothing is
/// copied until the buffer has to make room for new data.
#[derive(Debug, Default)]
pub struct Buffer {
    store: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: vec![0; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.store.len() - self.write_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Unconsumed bytes, starting at the read cursor.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.store[self.read_index..self.write_index]
    }

    /// Offset of the first CRLF in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        memmem::find(self.peek(), b"\r\n")
    }

    /// Advance the read cursor by `len` bytes.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.store[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Advance the write cursor after filling `begin_write()` externally.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_index += len;
    }

    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.store[self.write_index..]
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.store.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.store.copy_within(self.read_index..self.write_index, 0);
            self.read_index = 0;
            self.write_index = readable;
        }
    }

    /// One non-blocking scatter read from `fd`.
    ///
    /// Bytes that do not fit the free tail land in a stack overflow area and
    /// are appended afterwards, so nothing the kernel hands over is dropped.
    /// `Ok(0)` means the peer closed; `WouldBlock` is passed through.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ];
        let writable = self.writable_bytes();

        let n = {
            let tail = &mut self.store[self.write_index..];
            syscalls::readv_nonblocking(fd, &mut [tail, &mut extra[..]])?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.store.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;
    use std::io::Write;

    #[test]
    fn append_and_retrieve_move_cursors() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"GET / HTTP/1.1\r\n");
        assert_eq!(buf.readable_bytes(), 16);
        assert_eq!(buf.writable_bytes(), 0);

        buf.retrieve(4);
        assert_eq!(buf.peek(), b"/ HTTP/1.1\r\n");
        assert_eq!(buf.prependable_bytes(), 4);

        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(10);
        buf.append(b"XYZ");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.peek(), b"abcdefXYZ");

        buf.append(b"this no longer fits");
        assert!(buf.capacity() > 16);
        assert_eq!(buf.peek(), b"abcdefXYZthis no longer fits");
    }

    #[test]
    fn finds_crlf_relative_to_read_cursor() {
        let mut buf = Buffer::new();
        buf.append(b"a\r\nbc\r\n");
        assert_eq!(buf.find_crlf(), Some(1));
        buf.retrieve(3);
        assert_eq!(buf.find_crlf(), Some(2));
        buf.retrieve(4);
        assert_eq!(buf.find_crlf(), None);
    }

    #[test]
    fn io_write_appends() {
        let mut buf = Buffer::new();
        write!(buf, "Content-Length: {}\r\n", 42).unwrap();
        assert_eq!(buf.peek(), b"Content-Length: 42\r\n");
    }

    #[test]
    fn read_fd_overflows_into_extra_area() {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let written = syscalls::writev_nonblocking(fds[0], &[&payload[..]]).unwrap();
        assert_eq!(written, payload.len());

        let mut buf = Buffer::with_capacity(64);
        let n = buf.read_fd(fds[1]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);

        let err = buf.read_fd(fds[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        syscalls::close_fd(fds[0]);
        assert_eq!(buf.read_fd(fds[1]).unwrap(), 0);
        syscalls::close_fd(fds[1]);
    }

    #[quickcheck]
    fn readable_matches_appended_minus_retrieved(ops: Vec<(bool, Vec<u8>, u8)>) -> bool {
        let mut buf = Buffer::with_capacity(8);
        let mut model: VecDeque<u8> = VecDeque::new();

        for (is_append, data, take) in ops {
            if is_append {
                buf.append(&data);
                model.extend(data.iter().copied());
            } else {
                let take = (take as usize).min(model.len());
                buf.retrieve(take);
                model.drain(..take);
            }
            if buf.readable_bytes() != model.len() {
                return false;
            }
        }
        buf.peek().iter().copied().eq(model.into_iter())
    }
}
