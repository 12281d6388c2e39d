//! Handshake (operation) messages
//!
//! Before a device is imported, the peers exchange operation messages, each
//! prefixed by an 8-byte [`ControlHeader`]:
//!
//! ```text
//! OP_REQ_DEVLIST  [header]
//! OP_REP_DEVLIST  [header][u32 ndev][ndev x (device 312 + nif x interface 4)]
//! OP_REQ_IMPORT   [header][busid 32]
//! OP_REP_IMPORT   [header][device 312]   (status 0 only)
//! ```

use crate::codec::{FixedFrame, ensure_len, skip_padding, write_padding};
use crate::error::{ProtocolError, Result};
use crate::status::ST_OK;
use crate::types::{BusId, UsbPath};
use crate::version::USBIP_VERSION;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Handshake operation codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Request the list of exported devices
    ReqDevlist = 0x8005,
    /// Reply with the list of exported devices
    RepDevlist = 0x0005,
    /// Request to import a device by bus id
    ReqImport = 0x8003,
    /// Reply to an import request
    RepImport = 0x0003,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0x8005 => Ok(Self::ReqDevlist),
            0x0005 => Ok(Self::RepDevlist),
            0x8003 => Ok(Self::ReqImport),
            0x0003 => Ok(Self::RepImport),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

/// Handshake frame prefix (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Protocol version, [`USBIP_VERSION`] on everything we send
    pub version: u16,
    /// Raw operation code
    pub code: u16,
    /// Operation status, `ST_OK` for requests
    pub status: u32,
}

impl ControlHeader {
    /// Header for a request
    pub fn request(code: OpCode) -> Self {
        Self::reply(code, ST_OK)
    }

    /// Header for a reply with the given status
    pub fn reply(code: OpCode, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code: code as u16,
            status,
        }
    }

    /// Typed operation code
    pub fn op_code(&self) -> Result<OpCode> {
        OpCode::from_u16(self.code)
    }
}

impl FixedFrame for ControlHeader {
    const SIZE: usize = 8;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            version: reader.read_u16::<BigEndian>()?,
            code: reader.read_u16::<BigEndian>()?,
            status: reader.read_u32::<BigEndian>()?,
        })
    }
}

/// Exported device description (312 bytes), `struct usbip_usb_device`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSummaryHeader {
    pub path: UsbPath,
    pub busid: BusId,
    pub busnum: u32,
    pub devnum: u32,
    /// Raw speed value, see [`crate::DeviceSpeed`]
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub b_device_class: u8,
    pub b_device_subclass: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}

impl DeviceSummaryHeader {
    /// Device id used by transfer frames for this device
    pub fn devid(&self) -> u32 {
        crate::types::device_id(self.busnum, self.devnum)
    }
}

impl FixedFrame for DeviceSummaryHeader {
    const SIZE: usize = 312;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.path.write_to(writer)?;
        self.busid.write_to(writer)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed)?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.b_device_class)?;
        writer.write_u8(self.b_device_subclass)?;
        writer.write_u8(self.b_device_protocol)?;
        writer.write_u8(self.b_configuration_value)?;
        writer.write_u8(self.b_num_configurations)?;
        writer.write_u8(self.b_num_interfaces)?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            path: UsbPath::read_from(reader)?,
            busid: BusId::read_from(reader)?,
            busnum: reader.read_u32::<BigEndian>()?,
            devnum: reader.read_u32::<BigEndian>()?,
            speed: reader.read_u32::<BigEndian>()?,
            id_vendor: reader.read_u16::<BigEndian>()?,
            id_product: reader.read_u16::<BigEndian>()?,
            bcd_device: reader.read_u16::<BigEndian>()?,
            b_device_class: reader.read_u8()?,
            b_device_subclass: reader.read_u8()?,
            b_device_protocol: reader.read_u8()?,
            b_configuration_value: reader.read_u8()?,
            b_num_configurations: reader.read_u8()?,
            b_num_interfaces: reader.read_u8()?,
        })
    }
}

/// Interface record (4 bytes), `struct usbip_usb_interface`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceSummary {
    pub b_interface_class: u8,
    pub b_interface_subclass: u8,
    pub b_interface_protocol: u8,
}

impl FixedFrame for InterfaceSummary {
    const SIZE: usize = 4;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.b_interface_class)?;
        writer.write_u8(self.b_interface_subclass)?;
        writer.write_u8(self.b_interface_protocol)?;
        write_padding(writer, 1)
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let summary = Self {
            b_interface_class: reader.read_u8()?,
            b_interface_subclass: reader.read_u8()?,
            b_interface_protocol: reader.read_u8()?,
        };
        skip_padding(reader, 1)?;
        Ok(summary)
    }
}

/// One device entry of a devlist reply
///
/// `header.b_num_interfaces` decides how many interface records follow it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceSummary {
    pub header: DeviceSummaryHeader,
    pub interfaces: Vec<InterfaceSummary>,
}

impl DeviceSummary {
    /// Build a summary, setting the interface count from `interfaces`
    pub fn new(mut header: DeviceSummaryHeader, interfaces: Vec<InterfaceSummary>) -> Self {
        header.b_num_interfaces = interfaces.len().min(u8::MAX as usize) as u8;
        Self { header, interfaces }
    }

    /// Encoded size of this entry
    pub fn wire_size(&self) -> usize {
        DeviceSummaryHeader::SIZE + self.interfaces.len() * InterfaceSummary::SIZE
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer)?;
        for interface in self.interfaces.iter().take(self.header.b_num_interfaces as usize) {
            interface.write_to(writer)?;
        }
        Ok(())
    }

    /// Decode one entry, returning it and the number of bytes consumed
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = DeviceSummaryHeader::decode(bytes)?;
        let count = header.b_num_interfaces as usize;
        let size = DeviceSummaryHeader::SIZE + count * InterfaceSummary::SIZE;
        ensure_len(bytes, size)?;

        let mut cursor = Cursor::new(&bytes[DeviceSummaryHeader::SIZE..size]);
        let interfaces = (0..count)
            .map(|_| InterfaceSummary::read_from(&mut cursor))
            .collect::<Result<Vec<_>>>()?;

        Ok((Self { header, interfaces }, size))
    }
}

/// `OP_REQ_IMPORT` body (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpReqImport {
    pub busid: BusId,
}

impl OpReqImport {
    /// Full request frame, control header included
    pub fn encode_request(&self) -> Result<Vec<u8>> {
        let mut buf = ControlHeader::request(OpCode::ReqImport).encode()?;
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

impl FixedFrame for OpReqImport {
    const SIZE: usize = 32;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.busid.write_to(writer)
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            busid: BusId::read_from(reader)?,
        })
    }
}

/// `OP_REP_DEVLIST` reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpRepDevlist {
    pub devices: Vec<DeviceSummary>,
}

impl OpRepDevlist {
    /// Control header plus device count
    pub const PREFIX_SIZE: usize = ControlHeader::SIZE + 4;

    /// Full reply frame: header, count and every device entry
    pub fn encode(&self) -> Result<Vec<u8>> {
        let size = Self::PREFIX_SIZE
            + self
                .devices
                .iter()
                .map(DeviceSummary::wire_size)
                .sum::<usize>();
        let mut buf = Vec::with_capacity(size);

        ControlHeader::reply(OpCode::RepDevlist, ST_OK).write_to(&mut buf)?;
        buf.write_u32::<BigEndian>(self.devices.len() as u32)?;
        for device in &self.devices {
            device.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Decode a full reply frame, returning the header and the device list
    pub fn decode(bytes: &[u8]) -> Result<(ControlHeader, Self)> {
        ensure_len(bytes, Self::PREFIX_SIZE)?;
        let header = ControlHeader::decode(bytes)?;
        let count = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;

        let mut offset = Self::PREFIX_SIZE;
        let mut devices = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let (device, used) = DeviceSummary::decode(&bytes[offset..])?;
            devices.push(device);
            offset += used;
        }
        Ok((header, Self { devices }))
    }
}

/// `OP_REP_IMPORT` reply
///
/// The device header follows the control header only on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRepImport {
    pub status: u32,
    pub device: Option<DeviceSummaryHeader>,
}

impl OpRepImport {
    pub fn success(device: DeviceSummaryHeader) -> Self {
        Self {
            status: ST_OK,
            device: Some(device),
        }
    }

    pub fn failure(status: u32) -> Self {
        Self {
            status,
            device: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(ControlHeader::SIZE + DeviceSummaryHeader::SIZE);
        ControlHeader::reply(OpCode::RepImport, self.status).write_to(&mut buf)?;
        if self.status == ST_OK {
            if let Some(device) = &self.device {
                device.write_to(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Decode a full reply frame
    pub fn decode(bytes: &[u8]) -> Result<(ControlHeader, Self)> {
        let header = ControlHeader::decode(bytes)?;
        let device = if header.status == ST_OK {
            Some(DeviceSummaryHeader::decode(&bytes[ControlHeader::SIZE..])?)
        } else {
            None
        };
        Ok((
            header,
            Self {
                status: header.status,
                device,
            },
        ))
    }
}
