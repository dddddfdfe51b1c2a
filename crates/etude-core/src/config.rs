use crate::error::{EtudeError, EtudeResult};
use serde::Deserialize;
use std::str::FromStr;

/// Engine configuration, loaded from `ETUDE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0, all interfaces)
    pub host: String,

    /// Listening port (default: 8080)
    pub port: u16,

    /// Worker thread count (default: number of logical CPUs)
    pub workers: usize,

    /// Bounded depth of each worker's task queue (default: 10000)
    pub queue_depth: usize,

    /// Connection table size (default: 65535). Slots are indexed by
    /// descriptor number, so a client whose socket is numbered at or above
    /// this is refused. The process's own descriptors (listener, epoll,
    /// log files, ...) use low numbers too, so fewer than this many clients
    /// fit at once.
    pub max_connections: usize,

    /// Sliding idle timeout in milliseconds (default: 60000)
    pub idle_timeout_ms: u64,

    /// Readiness events handled per `epoll_wait` (default: 1024)
    pub max_events: usize,

    /// Largest request (head plus body) buffered before answering 400 (default: 64 MiB)
    pub max_request_bytes: usize,

    /// Pin worker threads to CPU cores (default: false)
    pub pin_workers: bool,

    /// Listen backlog (default: 1024)
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            queue_depth: 10_000,
            max_connections: 65_535,
            idle_timeout_ms: 60_000,
            max_events: 1024,
            max_request_bytes: 64 * 1024 * 1024,
            pin_workers: false,
            backlog: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    ///
    /// Unset variables keep their defaults; set but unparsable ones are an error.
    pub fn from_env() -> EtudeResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let d = Self::default();
        let config = Self {
            host: std::env::var("ETUDE_HOST").unwrap_or(d.host),
            port: env_or("ETUDE_PORT", d.port)?,
            workers: env_or("ETUDE_WORKERS", d.workers)?,
            queue_depth: env_or("ETUDE_QUEUE_DEPTH", d.queue_depth)?,
            max_connections: env_or("ETUDE_MAX_CONNECTIONS", d.max_connections)?,
            idle_timeout_ms: env_or("ETUDE_IDLE_TIMEOUT_MS", d.idle_timeout_ms)?,
            max_events: env_or("ETUDE_MAX_EVENTS", d.max_events)?,
            max_request_bytes: env_or("ETUDE_MAX_REQUEST_BYTES", d.max_request_bytes)?,
            pin_workers: matches!(
                std::env::var("ETUDE_PIN_WORKERS")
                    .unwrap_or_default()
                    .to_lowercase()
                    .as_str(),
                "true" | "1" | "yes"
            ),
            backlog: env_or("ETUDE_BACKLOG", d.backlog)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EtudeResult<()> {
        let zero = [
            ("workers", self.workers == 0),
            ("queue_depth", self.queue_depth == 0),
            ("max_connections", self.max_connections == 0),
            ("idle_timeout_ms", self.idle_timeout_ms == 0),
            ("max_events", self.max_events == 0),
            ("max_request_bytes", self.max_request_bytes == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, bad)| *bad) {
            return Err(EtudeError::Config(format!("{} must be greater than zero", name)));
        }
        if self.backlog <= 0 {
            return Err(EtudeError::Config("backlog must be positive".to_string()));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_timeout_ms)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> EtudeResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EtudeError::Config(format!("{} has invalid value {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}
