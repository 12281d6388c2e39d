//! Protocol version management

use std::fmt;

/// USB/IP protocol version spoken by this implementation
pub const USBIP_VERSION: u16 = 0x0111; // Version 1.1.1

/// Raw protocol version as it appears in handshake headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(pub u16);

/// Current protocol version
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion(USBIP_VERSION);

impl ProtocolVersion {
    /// Only the exact version is accepted, as the Linux usbip tools do
    pub fn is_supported(&self) -> bool {
        *self == CURRENT_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // BCD-ish nibbles: 0x0111 -> 1.1.1
        write!(
            f,
            "{}.{}.{}",
            (self.0 >> 8) & 0x0f,
            (self.0 >> 4) & 0x0f,
            self.0 & 0x0f
        )
    }
}
