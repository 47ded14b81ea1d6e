use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A remote sent bytes that do not follow its transport's message format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Sbd(#[from] crate::sbd::SbdError),

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A downlink backend could not be brought up. Not retried automatically.
    #[error("Transport init failed: {0}")]
    TransportInit(String),

    /// A downlink backend failed while running. Not retried automatically.
    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Input is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
