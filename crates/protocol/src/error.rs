//! Protocol error types

use thiserror::Error;

/// Wire-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes available than the structure's fixed size
    #[error("Malformed frame: needed {needed} bytes, got {available}")]
    MalformedFrame { needed: usize, available: usize },

    /// String content does not fit its fixed-width field
    #[error("Field {field} too long: {actual} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    /// Handshake header carried an unknown operation code
    #[error("Unknown op code: {0:#06x}")]
    UnknownOpCode(u16),

    /// Transfer header carried an unknown command
    #[error("Unknown USB/IP command: {0:#010x}")]
    UnknownCommand(u32),

    /// Handshake header carried another protocol version
    #[error("Unsupported protocol version: {0:#06x}")]
    VersionMismatch(u16),

    /// Direction field was neither OUT (0) nor IN (1)
    #[error("Invalid direction: {0}")]
    InvalidDirection(u32),

    /// Declared trailing data exceeds what the codec accepts
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer closed the stream cleanly between frames
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
