use std::io;

use thiserror::Error;

use super::codec::CodecError;
use super::types::PeerId;

/// Cluster payload decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: needed {needed}, have {have}")]
    InsufficientData { needed: usize, have: usize },
    #[error("unknown gossip message tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("unsupported gossip format version {0}")]
    UnsupportedVersion(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no link to peer {0}")]
    UnknownPeer(PeerId),
    #[error("link to peer {0} is closed")]
    LinkClosed(PeerId),
}

/// Reasons a client connection ends abnormally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    #[error("no packet within {0:?}")]
    IdleTimeout(std::time::Duration),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by broker")]
    Cancelled,
}
