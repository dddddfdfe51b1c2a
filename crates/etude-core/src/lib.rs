// src/lib.rs
//! Edge-triggered, oneshot epoll HTTP/1.x server engine.
//!
//! One reactor thread owns the listening socket and every socket read and
//! write; a fixed pool of workers parses requests and builds responses.
//! Connections live in a table indexed by descriptor and are evicted by a
//! sliding idle timer.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod http;
pub mod logging;
pub mod mapped;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod syscalls;
pub mod table;
pub mod timer;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{EtudeError, EtudeResult};
pub use handler::{Handler, StaticFiles};
pub use http::{Method, Request, ResponseIntent, Status, Version};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::{RunningServer, Server, ShutdownHandle};
