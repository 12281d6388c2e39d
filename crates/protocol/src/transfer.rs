//! Transfer-phase (URB) frames
//!
//! After a successful import, every frame starts with a 48-byte block: the
//! 20-byte [`MessageHeader`] followed by a 28-byte command body. Some frames
//! carry trailing data after that block:
//!
//! ```text
//! CMD_SUBMIT  [header][submit body]    [payload if OUT][iso descriptors]
//! RET_SUBMIT  [header][ret_submit body][payload if IN] [iso descriptors]
//! CMD_UNLINK  [header][unlink body]
//! RET_UNLINK  [header][ret_unlink body]
//! ```

use crate::codec::{
    FixedFrame, MAX_ISO_PACKETS, MAX_TRANSFER_SIZE, ensure_len, skip_padding, write_padding,
};
use crate::error::{ProtocolError, Result};
use crate::types::{Direction, IsoPacketDescriptor};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Transfer-phase command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Submit a USB request (URB)
    Submit = 0x0001,
    /// Unlink (cancel) a USB request
    Unlink = 0x0002,
    /// Return from USB request
    RetSubmit = 0x0003,
    /// Return from unlink
    RetUnlink = 0x0004,
}

impl Command {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0x0001 => Ok(Self::Submit),
            0x0002 => Ok(Self::Unlink),
            0x0003 => Ok(Self::RetSubmit),
            0x0004 => Ok(Self::RetUnlink),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Packet counts that mean "not isochronous"
pub fn is_iso_packet_count(number_of_packets: u32) -> bool {
    number_of_packets != 0 && number_of_packets != u32::MAX
}

/// USB/IP basic header (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: Command,
    /// Sequence number for matching requests and replies
    pub seqnum: u32,
    /// Device id, `(busnum << 16) | devnum`
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number, without the direction bit
    pub ep: u32,
}

impl MessageHeader {
    pub fn new(command: Command, seqnum: u32, devid: u32, direction: Direction, ep: u32) -> Self {
        Self {
            command,
            seqnum,
            devid,
            direction,
            ep,
        }
    }

    /// Endpoint address with the direction bit, as USB descriptors write it
    pub fn endpoint_address(&self) -> u8 {
        let number = (self.ep & 0x0f) as u8;
        if self.direction.is_in() {
            number | 0x80
        } else {
            number
        }
    }
}

impl FixedFrame for MessageHeader {
    const SIZE: usize = 20;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.command as u32)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction as u32)?;
        writer.write_u32::<BigEndian>(self.ep)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let command = Command::from_u32(reader.read_u32::<BigEndian>()?)?;
        let seqnum = reader.read_u32::<BigEndian>()?;
        let devid = reader.read_u32::<BigEndian>()?;
        let direction = Direction::from_u32(reader.read_u32::<BigEndian>()?)?;
        let ep = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            command,
            seqnum,
            devid,
            direction,
            ep,
        })
    }
}

/// CMD_SUBMIT body (28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitBody {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    /// Start frame for isochronous/interrupt transfers
    pub start_frame: u32,
    /// Number of isochronous packets
    pub number_of_packets: u32,
    /// Polling interval for interrupt/isochronous transfers
    pub interval: u32,
    /// Setup packet for control transfers
    pub setup: [u8; 8],
}

impl SubmitBody {
    pub fn is_iso(&self) -> bool {
        is_iso_packet_count(self.number_of_packets)
    }
}

impl FixedFrame for SubmitBody {
    const SIZE: usize = 28;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let transfer_flags = reader.read_u32::<BigEndian>()?;
        let transfer_buffer_length = reader.read_u32::<BigEndian>()?;
        let start_frame = reader.read_u32::<BigEndian>()?;
        let number_of_packets = reader.read_u32::<BigEndian>()?;
        let interval = reader.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        reader.read_exact(&mut setup)?;

        Ok(Self {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }
}

/// CMD_UNLINK body (28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnlinkBody {
    /// Sequence number of the SUBMIT to cancel
    pub unlink_seqnum: u32,
}

impl FixedFrame for UnlinkBody {
    const SIZE: usize = 28;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.unlink_seqnum)?;
        write_padding(writer, 24)
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let unlink_seqnum = reader.read_u32::<BigEndian>()?;
        skip_padding(reader, 24)?;
        Ok(Self { unlink_seqnum })
    }
}

/// RET_SUBMIT body (28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetSubmitBody {
    /// 0 on success, negative errno on failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl FixedFrame for RetSubmitBody {
    const SIZE: usize = 28;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.error_count)?;
        write_padding(writer, 8)
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let body = Self {
            status: reader.read_i32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            start_frame: reader.read_u32::<BigEndian>()?,
            number_of_packets: reader.read_u32::<BigEndian>()?,
            error_count: reader.read_u32::<BigEndian>()?,
        };
        skip_padding(reader, 8)?;
        Ok(body)
    }
}

/// RET_UNLINK body (28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetUnlinkBody {
    /// 0 when the target was cancelled, negative errno otherwise
    pub status: i32,
}

impl FixedFrame for RetUnlinkBody {
    const SIZE: usize = 28;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        write_padding(writer, 24)
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let status = reader.read_i32::<BigEndian>()?;
        skip_padding(reader, 24)?;
        Ok(Self { status })
    }
}

/// Command body, selected by the header's command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbBody {
    Submit(SubmitBody),
    Unlink(UnlinkBody),
    RetSubmit(RetSubmitBody),
    RetUnlink(RetUnlinkBody),
}

/// The fixed 48-byte block that starts every transfer-phase frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbPrefix {
    pub header: MessageHeader,
    pub body: UrbBody,
}

impl UrbPrefix {
    /// Number of bytes that follow this block on the wire
    ///
    /// Rejects lengths beyond [`MAX_TRANSFER_SIZE`] and packet counts beyond
    /// [`MAX_ISO_PACKETS`] before anything is allocated.
    pub fn trailing_len(&self) -> Result<usize> {
        let (payload, packets) = match &self.body {
            UrbBody::Submit(body) => {
                let payload = match self.header.direction {
                    Direction::Out => body.transfer_buffer_length as usize,
                    Direction::In => 0,
                };
                (payload, body.number_of_packets)
            }
            UrbBody::RetSubmit(body) => {
                let payload = match self.header.direction {
                    Direction::In => body.actual_length as usize,
                    Direction::Out => 0,
                };
                (payload, body.number_of_packets)
            }
            UrbBody::Unlink(_) | UrbBody::RetUnlink(_) => return Ok(0),
        };

        if payload > MAX_TRANSFER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload,
                max: MAX_TRANSFER_SIZE,
            });
        }

        let iso_count = if is_iso_packet_count(packets) {
            packets as usize
        } else {
            0
        };
        if iso_count > MAX_ISO_PACKETS {
            return Err(ProtocolError::FrameTooLarge {
                size: iso_count * IsoPacketDescriptor::SIZE,
                max: MAX_ISO_PACKETS * IsoPacketDescriptor::SIZE,
            });
        }

        Ok(payload + iso_count * IsoPacketDescriptor::SIZE)
    }

    /// Combine this block with its trailing bytes into a complete frame
    pub fn into_frame(self, trailing: &[u8]) -> Result<UrbFrame> {
        let needed = self.trailing_len()?;
        ensure_len(trailing, needed)?;

        let frame = match self.body {
            UrbBody::Submit(body) => {
                let payload_len = needed - iso_len(body.number_of_packets);
                let (payload, iso) = trailing[..needed].split_at(payload_len);
                UrbFrame::Submit(SubmitFrame {
                    header: self.header,
                    body,
                    payload: payload.to_vec(),
                    iso_packets: decode_iso(iso)?,
                })
            }
            UrbBody::RetSubmit(body) => {
                let payload_len = needed - iso_len(body.number_of_packets);
                let (payload, iso) = trailing[..needed].split_at(payload_len);
                UrbFrame::RetSubmit(RetSubmitFrame {
                    header: self.header,
                    body,
                    payload: payload.to_vec(),
                    iso_packets: decode_iso(iso)?,
                })
            }
            UrbBody::Unlink(body) => UrbFrame::Unlink(UnlinkFrame {
                header: self.header,
                body,
            }),
            UrbBody::RetUnlink(body) => UrbFrame::RetUnlink(RetUnlinkFrame {
                header: self.header,
                body,
            }),
        };
        Ok(frame)
    }
}

impl FixedFrame for UrbPrefix {
    const SIZE: usize = 48;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer)?;
        match &self.body {
            UrbBody::Submit(body) => body.write_to(writer),
            UrbBody::Unlink(body) => body.write_to(writer),
            UrbBody::RetSubmit(body) => body.write_to(writer),
            UrbBody::RetUnlink(body) => body.write_to(writer),
        }
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header = MessageHeader::read_from(reader)?;
        let body = match header.command {
            Command::Submit => UrbBody::Submit(SubmitBody::read_from(reader)?),
            Command::Unlink => UrbBody::Unlink(UnlinkBody::read_from(reader)?),
            Command::RetSubmit => UrbBody::RetSubmit(RetSubmitBody::read_from(reader)?),
            Command::RetUnlink => UrbBody::RetUnlink(RetUnlinkBody::read_from(reader)?),
        };
        Ok(Self { header, body })
    }
}

fn iso_len(number_of_packets: u32) -> usize {
    if is_iso_packet_count(number_of_packets) {
        number_of_packets as usize * IsoPacketDescriptor::SIZE
    } else {
        0
    }
}

fn decode_iso(bytes: &[u8]) -> Result<Vec<IsoPacketDescriptor>> {
    let mut cursor = Cursor::new(bytes);
    (0..bytes.len() / IsoPacketDescriptor::SIZE)
        .map(|_| IsoPacketDescriptor::read_from(&mut cursor))
        .collect()
}

fn write_iso<W: Write>(writer: &mut W, packets: &[IsoPacketDescriptor]) -> Result<()> {
    for packet in packets {
        packet.write_to(writer)?;
    }
    Ok(())
}

/// Complete CMD_SUBMIT frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitFrame {
    pub header: MessageHeader,
    pub body: SubmitBody,
    /// OUT data; empty for IN transfers
    pub payload: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

/// Complete CMD_UNLINK frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkFrame {
    pub header: MessageHeader,
    pub body: UnlinkBody,
}

/// Complete RET_SUBMIT frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmitFrame {
    pub header: MessageHeader,
    pub body: RetSubmitBody,
    /// IN data; empty for OUT transfers
    pub payload: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

/// Complete RET_UNLINK frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlinkFrame {
    pub header: MessageHeader,
    pub body: RetUnlinkBody,
}

impl RetSubmitFrame {
    /// Reply to `submit`, mirroring its seqnum, devid, direction and endpoint
    pub fn reply_to(submit: &MessageHeader, body: RetSubmitBody, payload: Vec<u8>) -> Self {
        Self {
            header: MessageHeader {
                command: Command::RetSubmit,
                ..*submit
            },
            body,
            payload,
            iso_packets: Vec::new(),
        }
    }
}

impl RetUnlinkFrame {
    /// Reply to the UNLINK frame `unlink` with `status`
    pub fn reply_to(unlink: &MessageHeader, status: i32) -> Self {
        Self {
            header: MessageHeader {
                command: Command::RetUnlink,
                ..*unlink
            },
            body: RetUnlinkBody { status },
        }
    }
}

/// Any complete transfer-phase frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbFrame {
    Submit(SubmitFrame),
    Unlink(UnlinkFrame),
    RetSubmit(RetSubmitFrame),
    RetUnlink(RetUnlinkFrame),
}

impl UrbFrame {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Self::Submit(f) => &f.header,
            Self::Unlink(f) => &f.header,
            Self::RetSubmit(f) => &f.header,
            Self::RetUnlink(f) => &f.header,
        }
    }

    pub fn seqnum(&self) -> u32 {
        self.header().seqnum
    }

    /// Encode the complete frame, trailing data included
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(UrbPrefix::SIZE + self.trailing_capacity());
        match self {
            Self::Submit(f) => {
                f.header.write_to(&mut buf)?;
                f.body.write_to(&mut buf)?;
                if f.header.direction == Direction::Out {
                    buf.write_all(&f.payload)?;
                }
                write_iso(&mut buf, &f.iso_packets)?;
            }
            Self::RetSubmit(f) => {
                f.header.write_to(&mut buf)?;
                f.body.write_to(&mut buf)?;
                if f.header.direction == Direction::In {
                    buf.write_all(&f.payload)?;
                }
                write_iso(&mut buf, &f.iso_packets)?;
            }
            Self::Unlink(f) => {
                f.header.write_to(&mut buf)?;
                f.body.write_to(&mut buf)?;
            }
            Self::RetUnlink(f) => {
                f.header.write_to(&mut buf)?;
                f.body.write_to(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Decode one complete frame, returning it and the number of bytes used
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let prefix = UrbPrefix::decode(bytes)?;
        let trailing = prefix.trailing_len()?;
        let frame = prefix.into_frame(&bytes[UrbPrefix::SIZE..])?;
        Ok((frame, UrbPrefix::SIZE + trailing))
    }

    fn trailing_capacity(&self) -> usize {
        match self {
            Self::Submit(f) => f.payload.len() + f.iso_packets.len() * IsoPacketDescriptor::SIZE,
            Self::RetSubmit(f) => f.payload.len() + f.iso_packets.len() * IsoPacketDescriptor::SIZE,
            Self::Unlink(_) | Self::RetUnlink(_) => 0,
        }
    }
}
