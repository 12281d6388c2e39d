//! USB/IP field types
//!
//! This module defines the small typed values that appear inside wire
//! structures: fixed-width strings, transfer direction, device speed and
//! isochronous packet descriptors.

use crate::codec::FixedFrame;
use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

/// Fixed-width, zero-padded byte string
///
/// Content shorter than `N` is right-padded with zeros. Content of exactly
/// `N` bytes carries no terminator. Readers stop at the first NUL byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedString<const N: usize>([u8; N]);

/// Bus id field (`busid[32]`)
pub type BusId = FixedString<32>;

/// Device path field (`path[256]`)
pub type UsbPath = FixedString<256>;

impl<const N: usize> FixedString<N> {
    /// Build from string content, rejecting content longer than the field
    pub fn new(content: &str) -> Result<Self> {
        Self::from_bytes(content.as_bytes())
    }

    /// Build from raw content bytes, rejecting content longer than the field
    pub fn from_bytes(content: &[u8]) -> Result<Self> {
        if content.len() > N {
            return Err(ProtocolError::FieldTooLong {
                field: if N == 32 { "busid" } else { "path" },
                max: N,
                actual: content.len(),
            });
        }
        let mut raw = [0u8; N];
        raw[..content.len()].copy_from_slice(content);
        Ok(Self(raw))
    }

    /// Wrap a raw field exactly as read from the wire
    pub fn from_raw(raw: [u8; N]) -> Self {
        Self(raw)
    }

    /// Content bytes up to (not including) the first NUL
    pub fn content(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        &self.0[..end]
    }

    /// Content as text, replacing invalid UTF-8
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }

    /// The full field including padding
    pub fn as_raw(&self) -> &[u8; N] {
        &self.0
    }

    /// True when content matches `other`, ignoring padding
    pub fn matches(&self, other: &str) -> bool {
        self.content() == other.as_bytes()
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl<const N: usize> FixedFrame for FixedString<N> {
    const SIZE: usize = N;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.0)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; N];
        reader.read_exact(&mut raw)?;
        Ok(Self(raw))
    }
}

/// Transfer direction, relative to the host
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Host to device (`USBIP_DIR_OUT`)
    #[default]
    Out = 0,
    /// Device to host (`USBIP_DIR_IN`)
    In = 1,
}

impl Direction {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    pub fn is_in(&self) -> bool {
        *self == Self::In
    }
}

/// USB device speed, as numbered by the kernel's `enum usb_device_speed`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSpeed {
    Unknown = 0,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low = 1,
    /// Full speed - 12 Mbps (USB 1.1)
    Full = 2,
    /// High speed - 480 Mbps (USB 2.0)
    #[default]
    High = 3,
    /// Wireless USB
    Wireless = 4,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super = 5,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus = 6,
}

impl DeviceSpeed {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    /// Maximum packet size of endpoint 0 for this speed
    pub fn ep0_max_packet(&self) -> u8 {
        match self {
            Self::Low => 8,
            Self::Super | Self::SuperPlus => 9, // exponent: 2^9 = 512
            _ => 64,
        }
    }
}

/// Device id used in transfer headers: `(busnum << 16) | devnum`
pub fn device_id(busnum: u32, devnum: u32) -> u32 {
    (busnum << 16) | (devnum & 0xffff)
}

/// Isochronous packet descriptor (16 bytes)
///
/// Carried after the payload of SUBMIT and RET_SUBMIT frames for
/// isochronous endpoints. The codec passes them through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    /// Offset of this packet within the transfer buffer
    pub offset: u32,
    /// Expected packet length
    pub length: u32,
    /// Transferred length (RET_SUBMIT)
    pub actual_length: u32,
    /// Packet status (RET_SUBMIT)
    pub status: i32,
}

impl FixedFrame for IsoPacketDescriptor {
    const SIZE: usize = 16;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
        })
    }
}
