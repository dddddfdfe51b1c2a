// src/table.rs
use crate::conn::Connection;
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::ServerMetrics;
use crate::syscalls::{self, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    /// Every connection registration is oneshot and watches for peer hangup.
    pub fn bits(self) -> i32 {
        let base = match self {
            Interest::Read => EPOLLIN,
            Interest::Write => EPOLLOUT,
        };
        base | EPOLLRDHUP | EPOLLONESHOT
    }
}

/// Fixed array of connection slots indexed by descriptor number.
///
/// Slots are allocated once and reused for every client that gets the same
/// descriptor; each reuse bumps the slot's generation. The epoll instance
/// lives here so workers can re-arm the connections they finish with.
pub struct ConnectionTable {
    slots: Box<[Mutex<Connection>]>,
    epoll: Epoll,
    metrics: Arc<ServerMetrics>,
    max_request_bytes: usize,
}

impl ConnectionTable {
    pub fn new(epoll: Epoll, capacity: usize, max_request_bytes: usize, metrics: Arc<ServerMetrics>) -> Self {
        let slots: Vec<Mutex<Connection>> = (0..capacity)
            .map(|_| Mutex::new(Connection::default()))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            epoll,
            metrics,
            max_request_bytes,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn epoll(&self) -> &Epoll {
        &self.epoll
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn live(&self) -> usize {
        self.metrics.active()
    }

    /// Lock the slot for `fd`. A poisoned slot is still usable: every field
    /// is reinitialised before the slot serves another client.
    pub fn slot(&self, fd: RawFd) -> Option<MutexGuard<'_, Connection>> {
        let index = usize::try_from(fd).ok()?;
        self.slots
            .get(index)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Claim the slot for a newly accepted socket and watch it for reading.
    /// Returns the slot's new generation.
    pub fn open(&self, fd: RawFd, peer: SocketAddr) -> EtudeResult<u64> {
        if self.live() >= self.capacity() {
            return Err(EtudeError::TableFull);
        }
        let mut conn = self.slot(fd).ok_or(EtudeError::FdOutOfRange(fd))?;
        let generation = conn.init(fd, Some(peer), self.max_request_bytes);
        if let Err(e) = self.epoll.add(fd, fd as u64, Interest::Read.bits()) {
            // The caller still owns the descriptor on failure.
            conn.init(-1, None, self.max_request_bytes);
            return Err(e.into());
        }
        self.metrics.inc_conn();
        Ok(generation)
    }

    /// Re-arm a connection whose slot the caller holds.
    pub fn rearm(&self, conn: &Connection, interest: Interest) -> io::Result<()> {
        let fd = conn.fd();
        self.epoll.modify(fd, fd as u64, interest.bits())
    }

    /// Close `fd`, waiting for the slot if a worker is finishing with it.
    /// Returns whether the descriptor was released by this call.
    pub fn close(&self, fd: RawFd) -> bool {
        match self.slot(fd) {
            Some(mut conn) => self.close_locked(&mut conn),
            None => false,
        }
    }

    /// Close `fd` without blocking.
    ///
    /// If a worker holds the slot the socket is only shut down; the worker's
    /// re-arm then reports a hangup and the reactor closes it for real.
    pub fn try_close(&self, fd: RawFd) -> bool {
        let Some(slot) = usize::try_from(fd).ok().and_then(|i| self.slots.get(i)) else {
            return false;
        };
        match slot.try_lock() {
            Ok(mut conn) => self.close_locked(&mut conn),
            Err(TryLockError::Poisoned(p)) => self.close_locked(&mut p.into_inner()),
            Err(TryLockError::WouldBlock) => {
                syscalls::shutdown_fd(fd);
                false
            }
        }
    }

    /// Close the connection behind a held slot guard.
    pub fn close_locked(&self, conn: &mut Connection) -> bool {
        if !conn.is_open() {
            return false;
        }
        let _ = self.epoll.delete(conn.fd());
        conn.close();
        self.metrics.dec_conn();
        true
    }

    /// Close every live connection. Workers must already be stopped.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for slot in self.slots.iter() {
            let mut conn = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if self.close_locked(&mut conn) {
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::epoll_event;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn socket_pair() -> (RawFd, RawFd) {
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
        (fds[0], fds[1])
    }

    fn peer() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000))
    }

    fn table(capacity: usize) -> ConnectionTable {
        ConnectionTable::new(Epoll::new().unwrap(), capacity, 1 << 20, Arc::new(ServerMetrics::new()))
    }

    #[test]
    fn open_close_tracks_live_count_and_generation() {
        let table = table(4096);
        let (a, b) = socket_pair();

        let g1 = table.open(a, peer()).unwrap();
        assert_eq!(table.live(), 1);
        assert!(table.close(a));
        assert!(!table.close(a));
        assert_eq!(table.live(), 0);

        // The kernel hands the same number out again.
        let (c, d) = socket_pair();
        if c == a {
            let g2 = table.open(c, peer()).unwrap();
            assert_eq!(g2, g1 + 1);
            table.close(c);
        } else {
            syscalls::close_fd(c);
        }
        syscalls::close_fd(b);
        syscalls::close_fd(d);
    }

    #[test]
    fn descriptor_beyond_table_is_refused() {
        // Empty table, but the descriptor number alone is out of range.
        let table = table(1);
        let (a, b) = socket_pair();
        assert_eq!(table.live(), 0);
        assert!(matches!(table.open(a, peer()), Err(EtudeError::FdOutOfRange(fd)) if fd == a));
        assert_eq!(table.live(), 0);
        syscalls::close_fd(a);
        syscalls::close_fd(b);
    }

    fn send(fd: RawFd, bytes: &[u8]) {
        assert_eq!(syscalls::writev_nonblocking(fd, &[bytes]).unwrap(), bytes.len());
    }

    fn events_for(table: &ConnectionTable, fd: RawFd, timeout_ms: i32) -> usize {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];
        let n = table.epoll().wait(&mut events, timeout_ms).unwrap();
        events[..n].iter().filter(|e| e.u64 == fd as u64).count()
    }

    #[test]
    fn oneshot_reports_once_until_rearmed() {
        let table = table(4096);
        let (a, b) = socket_pair();
        table.open(a, peer()).unwrap();

        // Two bursts of input before anyone looks: a single event.
        send(b, b"GET / HTTP/1.1\r\n");
        send(b, b"\r\n");
        assert_eq!(events_for(&table, a, 1000), 1);

        // Disarmed: more input and unread data produce nothing.
        send(b, b"x");
        assert_eq!(events_for(&table, a, 50), 0);
        assert_eq!(events_for(&table, a, 50), 0);

        {
            let conn = table.slot(a).unwrap();
            table.rearm(&conn, Interest::Read).unwrap();
        }
        assert_eq!(events_for(&table, a, 1000), 1);
        assert_eq!(events_for(&table, a, 50), 0);

        table.close(a);
        syscalls::close_fd(b);
    }

    #[test]
    fn busy_slot_is_shut_down_and_closed_after_rearm() {
        let table = table(4096);
        let (a, b) = socket_pair();
        table.open(a, peer()).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 8];
        {
            // A worker holds the slot while the idle timer fires.
            let conn = table.slot(a).unwrap();
            assert!(!table.try_close(a));
            assert_eq!(table.live(), 1);
            table.rearm(&conn, Interest::Write).unwrap();
        }

        let n = table.epoll().wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let flags = events[0].events;
        assert!(flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0);

        assert!(table.close(a));
        assert_eq!(table.live(), 0);
        syscalls::close_fd(b);
    }
}
