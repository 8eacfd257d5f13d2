//! Error types for the wire protocol and the snapshot delta engine

use thiserror::Error;

/// Errors raised while decoding packets, varints or snapshot deltas
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected end of buffer")]
    UnexpectedEnd,
    #[error("varint stream is truncated")]
    TruncatedVarint,
    #[error("invalid utf-8 in string field")]
    InvalidString,
    #[error("unknown message id {0}")]
    UnknownMessage(i32),
    #[error("envelope decode failed: {0}")]
    Envelope(String),
    #[error("delta out of bounds")]
    DeltaBounds,
    #[error("delta item type {0} out of range")]
    DeltaType(i32),
    #[error("delta item id {0} out of range")]
    DeltaId(i32),
    #[error("delta item size {0} out of range")]
    DeltaSize(i32),
    #[error("snapshot item limit exceeded")]
    TooManyItems,
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Envelope(err.to_string())
    }
}
