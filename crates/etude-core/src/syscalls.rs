// src/syscalls.rs
use crate::error::{EtudeError, EtudeResult};
use arrayvec::ArrayVec;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

pub use libc::epoll_event;

pub const EPOLLIN: i32 = libc::EPOLLIN;
pub const EPOLLOUT: i32 = libc::EPOLLOUT;
pub const EPOLLRDHUP: i32 = libc::EPOLLRDHUP;
pub const EPOLLHUP: i32 = libc::EPOLLHUP;
pub const EPOLLERR: i32 = libc::EPOLLERR;
pub const EPOLLONESHOT: i32 = libc::EPOLLONESHOT;

/// Most segments a single vectored call will carry.
const MAX_IOV: usize = 4;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to `host:port` with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> EtudeResult<RawFd> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if let Err(source) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(EtudeError::Bind { addr, source });
        }

        if libc::listen(fd, backlog) < 0 {
            let source = io::Error::last_os_error();
            libc::close(fd);
            return Err(EtudeError::Bind { addr, source });
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let rc = unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Accept one pending connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        };
    }

    let peer = sockaddr_to_std(&storage)
        .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
    Ok(Some((fd, peer)))
}

/// The address a socket is bound to.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_std(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Shut down both directions without releasing the descriptor number.
pub fn shutdown_fd(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

/// Writes to a socket the peer already closed must fail with EPIPE, not kill the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a descriptor. Every registration is edge triggered.
    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        let mut event = epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Wait for readiness. A negative timeout blocks indefinitely; EINTR yields zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Wake-up descriptor ----

/// Non-blocking eventfd used to interrupt a blocked `epoll_wait`.
pub struct EventFd {
    fd: c_int,
}

impl EventFd {
    pub fn new() -> EtudeResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const c_void, 8);
        }
    }

    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut c_void, 8);
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Vectored I/O ----

/// Scatter read into up to four buffers. `WouldBlock` is returned as an error.
pub fn readv_nonblocking(fd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let iovecs: ArrayVec<libc::iovec, MAX_IOV> = bufs
        .iter_mut()
        .take(MAX_IOV)
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut c_void,
            iov_len: b.len(),
        })
        .collect();

    let res = unsafe { libc::readv(fd, iovecs.as_ptr(), iovecs.len() as c_int) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// Gather write of up to four buffers in a single syscall. `WouldBlock` is returned as an error.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let iovecs: ArrayVec<libc::iovec, MAX_IOV> = bufs
        .iter()
        .filter(|b| !b.is_empty())
        .take(MAX_IOV)
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut c_void,
            iov_len: b.len(),
        })
        .collect();

    if iovecs.is_empty() {
        return Ok(0);
    }

    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as c_int) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}
