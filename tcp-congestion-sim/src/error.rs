//! Error taxonomy for a transfer session.
//!
//! Only unrecoverable conditions live here.  Packet loss, reordering and
//! duplicate ACKs are normal protocol events handled inside the congestion
//! controller and the reassembler; they never surface as errors.

use std::io;

use thiserror::Error;

use crate::packet::FrameError;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Socket or file failure.  Connection-fatal.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream before the session finished.
    #[error("connection closed by peer mid-transfer")]
    ConnectionClosed,

    /// A read could not satisfy the declared length.
    #[error("truncated stream: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// A header or handshake field that violates the wire format.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The configured ceiling on consecutive timeouts was exceeded.
    #[error("packet {seq} timed out {attempts} consecutive times; giving up")]
    RetriesExhausted { seq: u32, attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Self::Io(e),
            FrameError::Truncated { expected, got } => Self::Truncated { expected, got },
            other => Self::Malformed(other.to_string()),
        }
    }
}
