//! Error types shared by the registry and peer sides.

use tokio_util::codec::LinesCodecError;

/// Errors produced while framing or decoding protocol lines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Framing error: {0}")]
    Framing(#[from] LinesCodecError),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Errors surfaced by peer-side operations.
///
/// None of these are fatal to a peer: callers either retry, score the
/// failure as unreachable, or report it back to whoever asked.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no registry connection")]
    NotConnected,

    #[error("timed out")]
    Timeout,

    #[error("relay refused: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
