// src/server.rs
use crate::config::ServerConfig;
use crate::error::{EtudeError, EtudeResult};
use crate::handler::Handler;
use crate::metrics::ServerMetrics;
use crate::reactor::Reactor;
use crate::syscalls::{self, EventFd};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::info;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Listen on every interface at `port` with otherwise default settings.
    pub fn bind(port: u16) -> Self {
        Self::new(ServerConfig {
            port,
            ..ServerConfig::default()
        })
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind, spawn the reactor thread and return without blocking.
    pub fn start<H: Handler>(self, handler: H) -> EtudeResult<RunningServer> {
        let config = self.config;
        config.validate()?;
        syscalls::ignore_sigpipe();

        let listen_fd = syscalls::create_listen_socket(&config.host, config.port, config.backlog)?;
        let local_addr = match syscalls::local_addr(listen_fd) {
            Ok(addr) => addr,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e.into());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let wake = match EventFd::new() {
            Ok(wake) => Arc::new(wake),
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };
        let reactor = Reactor::new(&config, listen_fd, Arc::new(handler), stop.clone(), wake.clone())?;
        let metrics = reactor.metrics();

        info!(
            addr = %local_addr,
            workers = config.workers,
            idle_timeout_ms = config.idle_timeout_ms,
            "server listening"
        );

        let thread = thread::Builder::new()
            .name("etude-reactor".to_string())
            .spawn(move || reactor.run())?;

        Ok(RunningServer {
            local_addr,
            metrics,
            handle: ShutdownHandle { stop, wake },
            thread: Some(thread),
        })
    }

    /// Run until interrupted (Ctrl-C / SIGINT).
    pub fn serve<H: Handler>(self, handler: H) -> EtudeResult<()> {
        let running = self.start(handler)?;

        // Setup signal handling - ctrl-c graceful shutdown
        let handle = running.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("received interrupt, shutting down");
            handle.shutdown();
        })
        .map_err(|e| EtudeError::Signal(e.to_string()))?;

        running.join()?;
        info!("server shut down");
        Ok(())
    }
}

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<EventFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify();
    }
}

/// A server whose reactor runs on a background thread.
pub struct RunningServer {
    local_addr: SocketAddr,
    metrics: Arc<ServerMetrics>,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<EtudeResult<()>>>,
}

impl RunningServer {
    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Wait for the reactor thread to exit.
    pub fn join(mut self) -> EtudeResult<()> {
        self.wait()
    }

    fn wait(&mut self) -> EtudeResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| EtudeError::Io(io::Error::other("reactor thread panicked")))?,
            None => Ok(()),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
            let _ = self.wait();
        }
    }
}
