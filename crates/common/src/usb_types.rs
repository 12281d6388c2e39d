//! USB request and completion types shared by device backends
//!
//! A [`UrbRequest`] is what a backend receives for every accepted SUBMIT; it
//! answers with exactly one [`UrbCompletion`].

use protocol::status::{ECONNRESET, URB_OK};
use protocol::{
    BusId, DeviceSpeed, DeviceSummary, DeviceSummaryHeader, Direction, InterfaceSummary,
    IsoPacketDescriptor, UsbPath,
};

/// A decoded USB request block handed to a device backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UrbRequest {
    /// Sequence number of the originating SUBMIT
    pub seqnum: u32,
    pub direction: Direction,
    /// Endpoint number without the direction bit
    pub endpoint: u8,
    pub transfer_flags: u32,
    /// Requested length; the IN buffer size or the OUT payload size
    pub buffer_length: u32,
    pub setup: [u8; 8],
    /// OUT data; empty for IN requests
    pub payload: Vec<u8>,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl UrbRequest {
    /// Endpoint address with the direction bit set for IN
    pub fn endpoint_address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            Direction::Out => self.endpoint,
        }
    }

    pub fn is_control(&self) -> bool {
        self.endpoint == 0
    }

    pub fn setup_packet(&self) -> SetupPacket {
        SetupPacket::parse(&self.setup)
    }
}

/// Result of one USB request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UrbCompletion {
    /// 0 on success, negative errno otherwise
    pub status: i32,
    pub actual_length: u32,
    /// IN data; empty for OUT requests
    pub data: Vec<u8>,
    pub error_count: u32,
    /// Per-packet results for isochronous requests
    pub iso_packets: Option<Vec<IsoPacketDescriptor>>,
}

impl UrbCompletion {
    /// Successful IN completion carrying `data`
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            status: URB_OK,
            actual_length: data.len() as u32,
            data,
            ..Default::default()
        }
    }

    /// Successful OUT completion that consumed `length` bytes
    pub fn written(length: u32) -> Self {
        Self {
            status: URB_OK,
            actual_length: length,
            ..Default::default()
        }
    }

    /// Failed completion with a negative errno status
    pub fn error(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Completion for a request cancelled before it finished
    pub fn cancelled() -> Self {
        Self::error(ECONNRESET)
    }

    pub fn is_ok(&self) -> bool {
        self.status == URB_OK
    }
}

/// USB control setup packet (little-endian on the bus)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage is device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Standard request type (bits 5..6 are zero)
    pub fn is_standard(&self) -> bool {
        self.request_type & 0x60 == 0
    }

    /// Recipient bits (device, interface, endpoint, other)
    pub fn recipient(&self) -> u8 {
        self.request_type & 0x1f
    }
}

/// Bus location of a host USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// A host USB device found by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    pub address: DeviceAddress,
    /// Port path bus id, e.g. `1-1.4`
    pub bus_id: String,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    /// (class, subclass, protocol) of each interface in the active configuration
    pub interfaces: Vec<(u8, u8, u8)>,
}

impl HostDevice {
    /// Sysfs path the Linux tools report for this device
    pub fn sysfs_path(&self) -> String {
        format!("/sys/bus/usb/devices/{}", self.bus_id)
    }

    /// Build the exported device summary
    pub fn summary(&self) -> protocol::Result<DeviceSummary> {
        let header = DeviceSummaryHeader {
            path: UsbPath::new(&self.sysfs_path())?,
            busid: BusId::new(&self.bus_id)?,
            busnum: u32::from(self.address.bus),
            devnum: u32::from(self.address.address),
            speed: self.speed as u32,
            id_vendor: self.vendor_id,
            id_product: self.product_id,
            bcd_device: self.bcd_device,
            b_device_class: self.class,
            b_device_subclass: self.subclass,
            b_device_protocol: self.protocol,
            b_configuration_value: self.configuration_value,
            b_num_configurations: self.num_configurations,
            b_num_interfaces: 0,
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|&(class, subclass, protocol)| InterfaceSummary {
                b_interface_class: class,
                b_interface_subclass: subclass,
                b_interface_protocol: protocol,
            })
            .collect();
        Ok(DeviceSummary::new(header, interfaces))
    }
}
