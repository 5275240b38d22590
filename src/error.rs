//! Error Defs

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or oversized client handshake. The pair is closed
    /// silently, no reply body is owed to the peer.
    #[error("client protocol violation: {0}")]
    ClientProtocol(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("connect to {addr} failed")]
    ConnectFailed { addr: String },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("resolver: {0}")]
    Resolver(String),

    #[error("destination blocked by acl: {0}")]
    Blocked(String),

    #[error("buffer limit exceeded")]
    OutOfMemory,

    #[error("config: {0}")]
    Config(String),
}

impl ProxyError {
    /// Whether this error should be surfaced at WARN rather than DEBUG.
    pub fn is_noisy(&self) -> bool {
        matches!(self, ProxyError::Crypto(_) | ProxyError::Config(_))
    }
}
