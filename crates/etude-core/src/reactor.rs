// src/reactor.rs
use crate::config::ServerConfig;
use crate::conn::{Progress, ReadStatus, WriteStatus};
use crate::error::{EtudeError, EtudeResult};
use crate::handler::Handler;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, EventFd, epoll_event,
};
use crate::table::{ConnectionTable, Interest};
use crate::timer::HeapTimer;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTEN_TOKEN: u64 = u64::MAX;
const WAKE_TOKEN: u64 = u64::MAX - 1;

/// Unit of work handed to a worker: "process this connection", valid only
/// while the slot still holds the same client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub fd: RawFd,
    pub generation: u64,
}

/// Next step for a connection after the reactor has touched its socket.
enum Next {
    Wait,
    Submit(u64),
    Close,
}

/// The I/O thread: accepts, reads, writes, sweeps idle connections and
/// feeds parsed work to the pool.
pub struct Reactor {
    listen_fd: RawFd,
    table: Arc<ConnectionTable>,
    timers: HeapTimer,
    pool: WorkerPool<Task>,
    wake: Arc<EventFd>,
    stop: Arc<AtomicBool>,
    idle: Duration,
    events: Vec<epoll_event>,
}

impl Reactor {
    /// Takes ownership of `listen_fd`; it is closed when the reactor is dropped.
    pub fn new(
        config: &ServerConfig,
        listen_fd: RawFd,
        handler: Arc<dyn Handler>,
        stop: Arc<AtomicBool>,
        wake: Arc<EventFd>,
    ) -> EtudeResult<Self> {
        let built = Self::build(config, listen_fd, handler, stop, wake);
        if built.is_err() {
            syscalls::close_fd(listen_fd);
        }
        built
    }

    fn build(
        config: &ServerConfig,
        listen_fd: RawFd,
        handler: Arc<dyn Handler>,
        stop: Arc<AtomicBool>,
        wake: Arc<EventFd>,
    ) -> EtudeResult<Self> {
        let epoll = Epoll::new()?;
        epoll.add(listen_fd, LISTEN_TOKEN, EPOLLIN)?;
        epoll.add(wake.fd(), WAKE_TOKEN, EPOLLIN)?;

        let metrics = Arc::new(ServerMetrics::new());
        let table = Arc::new(ConnectionTable::new(
            epoll,
            config.max_connections,
            config.max_request_bytes,
            metrics,
        ));

        let worker_table = table.clone();
        let pool = WorkerPool::new(
            config.workers,
            config.queue_depth,
            "etude-worker",
            config.pin_workers,
            move |task: Task| process_task(&worker_table, &*handler, task),
        )?;

        Ok(Self {
            listen_fd,
            table,
            timers: HeapTimer::new(),
            pool,
            wake,
            stop,
            idle: config.idle_timeout(),
            events: vec![epoll_event { events: 0, u64: 0 }; config.max_events],
        })
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.table.metrics().clone()
    }

    /// Run until the stop flag is raised, then close every connection.
    pub fn run(mut self) -> EtudeResult<()> {
        info!(workers = self.pool.workers(), "reactor running");
        let result = self.event_loop();
        self.pool.shutdown();
        let closed = self.table.close_all();
        self.timers.clear();
        let snapshot = self.table.metrics().snapshot();
        info!(closed, ?snapshot, "reactor stopped");
        result
    }

    fn event_loop(&mut self) -> EtudeResult<()> {
        while !self.stop.load(Ordering::Acquire) {
            let timeout = self.next_timeout();
            let n = match self.table.epoll().wait(&mut self.events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll_wait failed: {}", e);
                    return Err(EtudeError::Io(e));
                }
            };

            for i in 0..n {
                let token = self.events[i].u64;
                let flags = self.events[i].events;
                match token {
                    LISTEN_TOKEN => self.accept_all(),
                    WAKE_TOKEN => self.wake.drain(),
                    fd => self.dispatch(fd as RawFd, flags),
                }
            }
        }
        Ok(())
    }

    /// Sweep expired timers; the wait bound is the time to the next expiry,
    /// rounded up so a timer is never polled early in a busy loop.
    fn next_timeout(&mut self) -> i32 {
        match self.timers.expire_and_next_deadline(Instant::now(), self.idle) {
            Some(wait) => {
                let ms = wait.as_micros().div_ceil(1000);
                ms.min(i32::MAX as u128) as i32
            }
            None => -1,
        }
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.register(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn register(&mut self, fd: RawFd, peer: SocketAddr) {
        match self.table.open(fd, peer) {
            Ok(_) => {
                let table = self.table.clone();
                self.timers.add(fd, Instant::now(), self.idle, move || {
                    debug!(fd, "idle timeout");
                    table.try_close(fd);
                });
                info!(fd, %peer, live = self.table.live(), "client in");
            }
            Err(e @ (EtudeError::TableFull | EtudeError::FdOutOfRange(_))) => {
                warn!(fd, %peer, "rejecting connection: {}", e);
                self.table.metrics().inc_rejected();
                syscalls::close_fd(fd);
            }
            Err(e) => {
                error!(fd, %peer, "failed to register connection: {}", e);
                self.table.metrics().inc_rejected();
                syscalls::close_fd(fd);
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd, flags: u32) {
        let flags = flags as i32;
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            self.close(fd);
        } else if flags & EPOLLIN != 0 {
            self.on_readable(fd);
        } else if flags & EPOLLOUT != 0 {
            self.on_writable(fd);
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        let next = {
            let Some(mut conn) = self.table.slot(fd) else {
                return;
            };
            if !conn.is_open() {
                return;
            }
            match conn.read() {
                Ok(ReadStatus::Open(n)) => {
                    if n > 0 {
                        self.timers.touch(fd);
                    }
                    Next::Submit(conn.generation())
                }
                Ok(ReadStatus::Closed) => Next::Close,
                Err(e) => {
                    debug!(fd, "read failed: {}", e);
                    Next::Close
                }
            }
        };
        self.follow(fd, next);
    }

    fn on_writable(&mut self, fd: RawFd) {
        let next = {
            let Some(mut conn) = self.table.slot(fd) else {
                return;
            };
            if !conn.is_open() {
                return;
            }
            match conn.write() {
                Ok((status, written)) => {
                    if written > 0 {
                        self.table.metrics().add_bytes(written);
                        self.timers.touch(fd);
                    }
                    match status {
                        WriteStatus::Pending => match self.table.rearm(&conn, Interest::Write) {
                            Ok(()) => Next::Wait,
                            Err(_) => Next::Close,
                        },
                        // Pipelined bytes are already buffered; no read event will announce them.
                        WriteStatus::KeepAlive if conn.has_buffered_input() => {
                            Next::Submit(conn.generation())
                        }
                        WriteStatus::KeepAlive => match self.table.rearm(&conn, Interest::Read) {
                            Ok(()) => Next::Wait,
                            Err(_) => Next::Close,
                        },
                        WriteStatus::Close => Next::Close,
                    }
                }
                Err(e) => {
                    debug!(fd, "write failed: {}", e);
                    Next::Close
                }
            }
        };
        self.follow(fd, next);
    }

    fn follow(&mut self, fd: RawFd, next: Next) {
        match next {
            Next::Wait => {}
            Next::Submit(generation) => {
                if let Err(e) = self.pool.submit(Task { fd, generation }) {
                    warn!(fd, "dropping connection: {}", e);
                    self.table.metrics().inc_rejected();
                    self.close(fd);
                }
            }
            Next::Close => self.close(fd),
        }
    }

    fn close(&mut self, fd: RawFd) {
        self.timers.remove(fd);
        if self.table.close(fd) {
            info!(fd, live = self.table.live(), "client quit");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}

/// Worker side: parse and build the response, then re-arm while still
/// holding the slot so a concurrent close cannot race the re-arm.
fn process_task(table: &ConnectionTable, handler: &dyn Handler, task: Task) {
    let Some(mut conn) = table.slot(task.fd) else {
        return;
    };
    if !conn.is_open() || conn.generation() != task.generation {
        debug!(fd = task.fd, "stale task dropped");
        return;
    }

    let interest = match conn.process(handler) {
        Progress::NeedMore => Interest::Read,
        Progress::Respond => {
            table.metrics().inc_req();
            Interest::Write
        }
    };
    if let Err(e) = table.rearm(&conn, interest) {
        error!(fd = task.fd, "re-arm failed: {}", e);
        syscalls::shutdown_fd(task.fd);
    }
}
