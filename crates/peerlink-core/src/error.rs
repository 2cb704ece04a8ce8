//! Error types for the direct-channel transfer protocol

use thiserror::Error;

/// Frame-level errors on the direct channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Reasons a single transfer fails
///
/// A transfer error never affects other transfers on the same channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("transfer {0} already exists")]
    DuplicateTransfer(String),

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("chunk {index} out of range (expected < {total})")]
    ChunkOutOfRange { index: u64, total: u64 },

    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u64,
        expected: usize,
        actual: usize,
    },

    #[error("incomplete transfer: {received} of {total} bytes")]
    Incomplete { received: u64, total: u64 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("no activity within {0} seconds")]
    IdleTimeout(u64),

    #[error("direct channel closed")]
    ChannelClosed,

    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}
