//! Virtual loopback device
//!
//! A vendor-specific device with one interface and a bulk endpoint pair.
//! Data written to bulk OUT endpoint 1 is read back from bulk IN endpoint
//! 0x81. Endpoint 0 answers the standard requests a host needs to enumerate
//! and configure the device; anything else stalls.

use super::{BackendFactory, DeviceBackend, OpenFuture};
use crate::config::VirtualDeviceConfig;
use common::{SetupPacket, UrbCompletion, UrbRequest};
use protocol::status::{EBUSY, EINVAL, EPIPE, ESHUTDOWN};
use protocol::{
    BusId, DeviceSpeed, DeviceSummary, DeviceSummaryHeader, Direction, InterfaceSummary, UsbPath,
    is_iso_packet_count,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, trace};

const USB_REQUEST_GET_STATUS: u8 = 0x00;
const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const USB_REQUEST_GET_CONFIGURATION: u8 = 0x08;
const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;
const USB_REQUEST_GET_INTERFACE: u8 = 0x0a;
const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;

const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;

/// Bulk endpoint number used in both directions
pub const LOOPBACK_ENDPOINT: u8 = 1;

/// Bytes the OUT endpoint buffers before it reports `-EBUSY`
pub const LOOPBACK_CAPACITY: usize = 1024 * 1024;

const BCD_DEVICE: u16 = 0x0100;
const INTERFACE_CLASS_VENDOR: u8 = 0xff;

/// Identity of a loopback device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackProfile {
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl LoopbackProfile {
    fn bulk_max_packet(&self) -> u16 {
        match self.speed {
            DeviceSpeed::High => 512,
            _ => 64,
        }
    }

    fn device_descriptor(&self) -> Vec<u8> {
        let [vid_lo, vid_hi] = self.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.product_id.to_le_bytes();
        let [bcd_lo, bcd_hi] = BCD_DEVICE.to_le_bytes();
        vec![
            0x12, // bLength
            USB_DESCRIPTOR_TYPE_DEVICE,
            0x00,
            0x02, // bcdUSB (2.00)
            0x00, // bDeviceClass (per interface)
            0x00, // bDeviceSubClass
            0x00, // bDeviceProtocol
            self.speed.ep0_max_packet(),
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            bcd_lo,
            bcd_hi,
            0x00, // iManufacturer
            0x00, // iProduct
            0x00, // iSerialNumber
            0x01, // bNumConfigurations
        ]
    }

    fn config_descriptor(&self) -> Vec<u8> {
        let [mps_lo, mps_hi] = self.bulk_max_packet().to_le_bytes();

        // Config(9) + Interface(9) + 2 x Endpoint(7) = 32 bytes
        vec![
            // Configuration descriptor
            0x09,
            USB_DESCRIPTOR_TYPE_CONFIGURATION,
            32,
            0x00, // wTotalLength
            0x01, // bNumInterfaces
            0x01, // bConfigurationValue
            0x00, // iConfiguration
            0x80, // bmAttributes (bus powered)
            50,   // bMaxPower (100mA)
            // Interface descriptor
            0x09,
            0x04,
            0x00, // bInterfaceNumber
            0x00, // bAlternateSetting
            0x02, // bNumEndpoints
            INTERFACE_CLASS_VENDOR,
            0x00,
            0x00,
            0x00, // iInterface
            // Endpoint descriptor (Bulk IN)
            0x07,
            0x05,
            0x80 | LOOPBACK_ENDPOINT,
            0x02,
            mps_lo,
            mps_hi,
            0x00,
            // Endpoint descriptor (Bulk OUT)
            0x07,
            0x05,
            LOOPBACK_ENDPOINT,
            0x02,
            mps_lo,
            mps_hi,
            0x00,
        ]
    }

    /// Summary published in devlist and import replies
    pub fn summary(
        &self,
        bus_id: &str,
        path: &str,
        busnum: u32,
        devnum: u32,
    ) -> protocol::Result<DeviceSummary> {
        let header = DeviceSummaryHeader {
            path: UsbPath::new(path)?,
            busid: BusId::new(bus_id)?,
            busnum,
            devnum,
            speed: self.speed as u32,
            id_vendor: self.vendor_id,
            id_product: self.product_id,
            bcd_device: BCD_DEVICE,
            b_device_class: 0,
            b_device_subclass: 0,
            b_device_protocol: 0,
            b_configuration_value: 1,
            b_num_configurations: 1,
            b_num_interfaces: 0,
        };
        Ok(DeviceSummary::new(
            header,
            vec![InterfaceSummary {
                b_interface_class: INTERFACE_CLASS_VENDOR,
                b_interface_subclass: 0,
                b_interface_protocol: 0,
            }],
        ))
    }
}

impl From<&VirtualDeviceConfig> for LoopbackProfile {
    fn from(config: &VirtualDeviceConfig) -> Self {
        Self {
            speed: config.speed,
            vendor_id: config.vendor_id,
            product_id: config.product_id,
        }
    }
}

/// An IN request parked until OUT data arrives
struct PendingRead {
    seqnum: u32,
    length: usize,
    reply: oneshot::Sender<UrbCompletion>,
}

#[derive(Default)]
struct LoopbackState {
    configuration: u8,
    buffer: VecDeque<u8>,
    readers: VecDeque<PendingRead>,
    released: bool,
}

/// One imported instance of a loopback device
pub struct LoopbackDevice {
    profile: LoopbackProfile,
    state: Mutex<LoopbackState>,
}

impl LoopbackDevice {
    pub fn new(profile: LoopbackProfile) -> Self {
        Self {
            profile,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes written to OUT and not yet read back
    pub fn buffered(&self) -> usize {
        self.state().buffer.len()
    }

    fn handle_control(&self, urb: &UrbRequest) -> UrbCompletion {
        let setup = urb.setup_packet();
        trace!(
            "Loopback control seq={} type={:#04x} req={:#04x} value={:#06x}",
            urb.seqnum, setup.request_type, setup.request, setup.value
        );

        if setup.is_in() {
            match self.handle_setup_in(&setup) {
                Some(mut data) => {
                    let limit = (setup.length as usize).min(urb.buffer_length as usize);
                    data.truncate(limit);
                    UrbCompletion::with_data(data)
                }
                None => UrbCompletion::error(EPIPE),
            }
        } else if self.handle_no_data_request(&setup) {
            UrbCompletion::written(0)
        } else {
            UrbCompletion::error(EPIPE)
        }
    }

    fn handle_setup_in(&self, setup: &SetupPacket) -> Option<Vec<u8>> {
        match (setup.request_type, setup.request) {
            (0x80, USB_REQUEST_GET_STATUS) => Some(vec![0, 0]),
            (0x81, USB_REQUEST_GET_STATUS) => (setup.index == 0).then_some(vec![0, 0]),
            (0x82, USB_REQUEST_GET_STATUS) => {
                let ep = (setup.index & 0x7f) as u8;
                (ep == LOOPBACK_ENDPOINT).then_some(vec![0, 0])
            }
            (0x80, USB_REQUEST_GET_DESCRIPTOR) => {
                let desc_type = (setup.value >> 8) as u8;
                let desc_index = (setup.value & 0x00ff) as u8;
                match desc_type {
                    USB_DESCRIPTOR_TYPE_DEVICE => Some(self.profile.device_descriptor()),
                    USB_DESCRIPTOR_TYPE_CONFIGURATION => Some(self.profile.config_descriptor()),
                    // Only the language table; the device names no strings
                    USB_DESCRIPTOR_TYPE_STRING if desc_index == 0 => {
                        Some(vec![4, USB_DESCRIPTOR_TYPE_STRING, 0x09, 0x04])
                    }
                    _ => None,
                }
            }
            (0x80, USB_REQUEST_GET_CONFIGURATION) => Some(vec![self.state().configuration]),
            (0x81, USB_REQUEST_GET_INTERFACE) => (setup.index == 0).then_some(vec![0]),
            _ => None,
        }
    }

    fn handle_no_data_request(&self, setup: &SetupPacket) -> bool {
        match (setup.request_type, setup.request) {
            (0x00, USB_REQUEST_SET_CONFIGURATION) => {
                let cfg = (setup.value & 0x00ff) as u8;
                if cfg > 1 {
                    return false;
                }
                self.state().configuration = cfg;
                true
            }
            (0x01, USB_REQUEST_SET_INTERFACE) => setup.value == 0 && setup.index == 0,
            (0x00 | 0x01 | 0x02, USB_REQUEST_CLEAR_FEATURE) => true,
            _ => false,
        }
    }

    /// Hand buffered bytes to parked readers in arrival order
    fn serve_readers(state: &mut LoopbackState) {
        while !state.buffer.is_empty() {
            let Some(reader) = state.readers.pop_front() else {
                break;
            };
            if reader.reply.is_closed() {
                continue;
            }
            let take = reader.length.min(state.buffer.len());
            let data: Vec<u8> = state.buffer.drain(..take).collect();
            trace!("Loopback IN seq={} completed with {} bytes", reader.seqnum, take);
            let _ = reader.reply.send(UrbCompletion::with_data(data));
        }
    }
}

impl DeviceBackend for LoopbackDevice {
    fn submit(&self, urb: UrbRequest, reply: oneshot::Sender<UrbCompletion>) {
        if self.state().released {
            let _ = reply.send(UrbCompletion::error(ESHUTDOWN));
            return;
        }

        if urb.is_control() {
            let _ = reply.send(self.handle_control(&urb));
            return;
        }

        if urb.endpoint != LOOPBACK_ENDPOINT || is_iso_packet_count(urb.number_of_packets) {
            let _ = reply.send(UrbCompletion::error(EINVAL));
            return;
        }

        let mut state = self.state();
        match urb.direction {
            Direction::Out => {
                if state.buffer.len() + urb.payload.len() > LOOPBACK_CAPACITY {
                    let _ = reply.send(UrbCompletion::error(EBUSY));
                    return;
                }
                state.buffer.extend(urb.payload.iter().copied());
                let _ = reply.send(UrbCompletion::written(urb.payload.len() as u32));
                Self::serve_readers(&mut state);
            }
            Direction::In => {
                state.readers.push_back(PendingRead {
                    seqnum: urb.seqnum,
                    length: urb.buffer_length as usize,
                    reply,
                });
                Self::serve_readers(&mut state);
            }
        }
    }

    fn cancel(&self, seqnum: u32) {
        let mut state = self.state();
        if let Some(index) = state.readers.iter().position(|r| r.seqnum == seqnum) {
            if let Some(reader) = state.readers.remove(index) {
                debug!("Loopback IN seq={} cancelled", seqnum);
                let _ = reader.reply.send(UrbCompletion::cancelled());
            }
        }
    }

    fn release(&self) {
        let mut state = self.state();
        state.released = true;
        state.buffer.clear();
        for reader in state.readers.drain(..) {
            let _ = reader.reply.send(UrbCompletion::error(ESHUTDOWN));
        }
    }
}

/// Opens a fresh loopback device for every import
pub struct LoopbackFactory {
    profile: LoopbackProfile,
}

impl LoopbackFactory {
    pub fn new(profile: LoopbackProfile) -> Self {
        Self { profile }
    }
}

impl BackendFactory for LoopbackFactory {
    fn open(&self) -> OpenFuture<'_> {
        let device: Arc<dyn DeviceBackend> = Arc::new(LoopbackDevice::new(self.profile));
        Box::pin(async move { Ok(device) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_control_urb, create_mock_setup_packet, create_mock_urb};
    use protocol::status::{ECONNRESET, URB_OK};

    fn device() -> LoopbackDevice {
        LoopbackDevice::new(LoopbackProfile {
            speed: DeviceSpeed::High,
            vendor_id: 0x1d6b,
            product_id: 0x0104,
        })
    }

    fn submit(device: &LoopbackDevice, urb: UrbRequest) -> oneshot::Receiver<UrbCompletion> {
        let (tx, rx) = oneshot::channel();
        device.submit(urb, tx);
        rx
    }

    #[tokio::test]
    async fn test_get_device_descriptor() {
        let device = device();
        let setup = create_mock_setup_packet(0x80, USB_REQUEST_GET_DESCRIPTOR, 0x0100, 0, 18);
        let completion = submit(&device, create_mock_control_urb(1, setup)).await.unwrap();

        assert_eq!(completion.status, URB_OK);
        assert_eq!(completion.actual_length, 18);
        assert_eq!(&completion.data[8..12], &[0x6b, 0x1d, 0x04, 0x01]);
    }

    #[tokio::test]
    async fn test_config_descriptor_is_truncated_to_request() {
        let device = device();
        let setup = create_mock_setup_packet(0x80, USB_REQUEST_GET_DESCRIPTOR, 0x0200, 0, 9);
        let completion = submit(&device, create_mock_control_urb(2, setup)).await.unwrap();
        assert_eq!(completion.data.len(), 9);
        assert_eq!(completion.data[2], 32);

        let setup = create_mock_setup_packet(0x80, USB_REQUEST_GET_DESCRIPTOR, 0x0200, 0, 255);
        let completion = submit(&device, create_mock_control_urb(3, setup)).await.unwrap();
        assert_eq!(completion.data.len(), 32);
        assert_eq!(&completion.data[22..24], &512u16.to_le_bytes());
    }

    #[tokio::test]
    async fn test_set_and_get_configuration() {
        let device = device();
        let set = create_mock_setup_packet(0x00, USB_REQUEST_SET_CONFIGURATION, 1, 0, 0);
        assert!(submit(&device, create_mock_control_urb(1, set)).await.unwrap().is_ok());

        let get = create_mock_setup_packet(0x80, USB_REQUEST_GET_CONFIGURATION, 0, 0, 1);
        let completion = submit(&device, create_mock_control_urb(2, get)).await.unwrap();
        assert_eq!(completion.data, vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_request_stalls() {
        let device = device();
        let setup = create_mock_setup_packet(0xC0, 0x42, 0, 0, 4);
        let completion = submit(&device, create_mock_control_urb(1, setup)).await.unwrap();
        assert_eq!(completion.status, EPIPE);
    }

    #[tokio::test]
    async fn test_out_then_in_loops_back() {
        let device = device();
        let written = submit(&device, create_mock_urb(1, Direction::Out, 1, 40)).await.unwrap();
        assert_eq!(written.actual_length, 40);
        assert_eq!(device.buffered(), 40);

        let read = submit(&device, create_mock_urb(2, Direction::In, 1, 64)).await.unwrap();
        assert_eq!(read.actual_length, 40);
        assert_eq!(read.data, common::test_utils::create_mock_bulk_data(40));
        assert_eq!(device.buffered(), 0);
    }

    #[tokio::test]
    async fn test_in_waits_for_out() {
        let device = device();
        let mut pending = submit(&device, create_mock_urb(1, Direction::In, 1, 8));
        assert!(pending.try_recv().is_err());

        let _ = submit(&device, create_mock_urb(2, Direction::Out, 1, 16)).await.unwrap();
        let read = pending.await.unwrap();
        assert_eq!(read.actual_length, 8);
        assert_eq!(device.buffered(), 8);
    }

    #[tokio::test]
    async fn test_cancel_parked_read() {
        let device = device();
        let pending = submit(&device, create_mock_urb(9, Direction::In, 1, 64));
        device.cancel(9);
        assert_eq!(pending.await.unwrap().status, ECONNRESET);
    }

    #[tokio::test]
    async fn test_release_fails_readers_and_later_submits() {
        let device = device();
        let pending = submit(&device, create_mock_urb(1, Direction::In, 1, 64));
        device.release();
        assert_eq!(pending.await.unwrap().status, ESHUTDOWN);

        let late = submit(&device, create_mock_urb(2, Direction::Out, 1, 4)).await.unwrap();
        assert_eq!(late.status, ESHUTDOWN);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_rejected() {
        let device = device();
        let completion = submit(&device, create_mock_urb(1, Direction::In, 3, 8)).await.unwrap();
        assert_eq!(completion.status, EINVAL);
    }
}
