//! Connection error types

use protocol::{Command, ProtocolError};
use thiserror::Error;

/// Reasons a connection is closed for breaking the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("duplicate pending seqnum {0}")]
    DuplicateSeqnum(u32),

    #[error("unexpected op code {0:#06x} during handshake")]
    UnexpectedOpCode(u16),

    #[error("unsupported protocol version {0:#06x}")]
    VersionMismatch(u16),

    #[error("transfer command {0:#x} before import")]
    TransferBeforeImport(u16),

    #[error("unexpected command {0:?} after import")]
    UnexpectedCommand(Command),
}

/// Errors that end a client connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Malformed frame: {0}")]
    Malformed(ProtocolError),

    #[error("Protocol violation: {0}")]
    Violation(#[from] Violation),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            other => Self::Malformed(other),
        }
    }
}

impl ConnectionError {
    /// True when the peer simply went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
