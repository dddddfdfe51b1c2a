use std::io;
use std::net::SocketAddr;

/// Central error type for the etude engine.
#[derive(Debug, thiserror::Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Binding or listening on the server address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The live-connection cap was reached.
    #[error("connection table is full")]
    TableFull,
    /// The descriptor does not fit in the connection table.
    #[error("descriptor {0} is outside the connection table")]
    FdOutOfRange(i32),
    /// Every worker queue is at capacity.
    #[error("all worker queues are full")]
    QueueFull,
    /// The worker pool has been shut down.
    #[error("worker pool is shut down")]
    PoolClosed,
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The interrupt handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signal(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
