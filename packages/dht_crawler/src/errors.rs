use thiserror::Error;

/// Failures that stay local to one datagram, one session, or one
/// searcher -- never propagated out of the DHT engine or the fetch
/// pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bencode codec error: {0}")]
    Codec(#[from] serde_bencode::Error),

    #[error("malformed KRPC message: {0}")]
    MalformedMessage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("metadata SHA-1 did not match info hash")]
    HashMismatch,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to bind {addr}: {cause}")]
    Bind {
        addr: std::net::SocketAddr,
        cause: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
