//! Test utilities for usbip-export
//!
//! Provides mock device summaries, USB requests and helper functions for
//! testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_summary;
//!
//! let device = create_mock_summary("1-1", 1, 2);
//! assert!(device.header.busid.matches("1-1"));
//! assert_eq!(device.header.devid(), 0x0001_0002);
//! ```

use crate::usb_types::UrbRequest;
use protocol::{
    BusId, DeviceSpeed, DeviceSummary, DeviceSummaryHeader, Direction, InterfaceSummary, UsbPath,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock vendor-specific device summary with one interface
///
/// # Arguments
/// * `bus_id` - Bus id string, e.g. `"1-1"`
/// * `busnum` - Bus number
/// * `devnum` - Device number on the bus
pub fn create_mock_summary(bus_id: &str, busnum: u32, devnum: u32) -> DeviceSummary {
    create_mock_summary_with_class(bus_id, busnum, devnum, 0xff, 0x00, 0x00)
}

/// Create a mock device summary whose single interface has the given class
pub fn create_mock_summary_with_class(
    bus_id: &str,
    busnum: u32,
    devnum: u32,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> DeviceSummary {
    let header = DeviceSummaryHeader {
        path: UsbPath::new(&format!("/sys/devices/usbip-test/{}", bus_id))
            .unwrap_or_default(),
        busid: BusId::new(bus_id).unwrap_or_default(),
        busnum,
        devnum,
        speed: DeviceSpeed::High as u32,
        id_vendor: 0x1234,
        id_product: 0x5678,
        bcd_device: 0x0100,
        b_device_class: 0x00,
        b_device_subclass: 0x00,
        b_device_protocol: 0x00,
        b_configuration_value: 1,
        b_num_configurations: 1,
        b_num_interfaces: 0,
    };
    DeviceSummary::new(
        header,
        vec![InterfaceSummary {
            b_interface_class: class,
            b_interface_subclass: subclass,
            b_interface_protocol: protocol,
        }],
    )
}

/// Create a mock mass storage device summary
pub fn create_mock_mass_storage_summary(bus_id: &str, busnum: u32, devnum: u32) -> DeviceSummary {
    create_mock_summary_with_class(bus_id, busnum, devnum, 0x08, 0x06, 0x50)
}

/// Create a list of mock devices on bus 1 (`1-1`, `1-2`, ...)
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_list;
///
/// let devices = create_mock_device_list(5);
/// assert_eq!(devices.len(), 5);
/// ```
pub fn create_mock_device_list(count: u32) -> Vec<DeviceSummary> {
    (1..=count)
        .map(|i| create_mock_summary(&format!("1-{}", i), 1, i + 1))
        .collect()
}

/// Create a mock USB request for a non-control endpoint
///
/// OUT requests carry `length` bytes of patterned data.
pub fn create_mock_urb(seqnum: u32, direction: Direction, endpoint: u8, length: u32) -> UrbRequest {
    let payload = match direction {
        Direction::Out => create_mock_bulk_data(length as usize),
        Direction::In => Vec::new(),
    };
    UrbRequest {
        seqnum,
        direction,
        endpoint,
        buffer_length: length,
        payload,
        ..Default::default()
    }
}

/// Create a mock control request on endpoint 0
pub fn create_mock_control_urb(seqnum: u32, setup: [u8; 8]) -> UrbRequest {
    let direction = if setup[0] & 0x80 != 0 {
        Direction::In
    } else {
        Direction::Out
    };
    UrbRequest {
        seqnum,
        direction,
        endpoint: 0,
        buffer_length: u32::from(u16::from_le_bytes([setup[6], setup[7]])),
        setup,
        ..Default::default()
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x00, // iManufacturer
        0x00, // iProduct
        0x00, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Create a mock control transfer setup packet
///
/// # Arguments
/// * `request_type` - bmRequestType
/// * `request` - bRequest
/// * `value` - wValue
/// * `index` - wIndex
/// * `length` - wLength
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (index & 0xFF) as u8,
        ((index >> 8) & 0xFF) as u8,
        (length & 0xFF) as u8,
        ((length >> 8) & 0xFF) as u8,
    ]
}
