use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal broker errors. Any of these aborts startup.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot determine node identity: {0}")]
    Identity(String),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
