//! Error taxonomy for flock nodes
//!
//! Startup failures (bind, publish) abort the process. Everything else is
//! reported to the loop that hit it, which logs and carries on.

use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlockError>;

#[derive(Debug, Error)]
pub enum FlockError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to publish advertisement: {0}")]
    Publish(String),

    #[error("discovery session failed: {0}")]
    DiscoverySession(String),

    #[error("adoption RPC to {target} failed: {message}")]
    Rpc { target: SocketAddr, message: String },

    #[error("configuration apply failed: {0}")]
    Apply(String),

    #[error("join token unavailable: {0}")]
    Token(String),

    #[error("verification failed: {}", .0.join("; "))]
    Verification(Vec<String>),

    #[error("metadata collection failed: {0}")]
    Metadata(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FlockError {
    /// A node that cannot be reached or discovered is useless, so these end the process.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, FlockError::Bind { .. } | FlockError::Publish(_))
    }
}
