use std::io;

/// Errors raised by the site's storage layer.
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Password hashing or hash parsing failed.
    #[error("password hash error: {0}")]
    Hash(String),
    /// No pooled store handle became free in time.
    #[error("user store pool exhausted")]
    PoolExhausted,
}

pub type SiteResult<T> = Result<T, SiteError>;
