use thiserror::Error;

/// Unified error type for the relay binary.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
