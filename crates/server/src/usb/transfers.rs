//! USB transfer execution
//!
//! Runs one [`UrbRequest`] synchronously through rusb and turns the outcome
//! into a [`UrbCompletion`] with a Linux errno status.

use crate::usb::device::UsbDevice;
use common::{SetupPacket, UrbCompletion, UrbRequest};
use protocol::status::{EBUSY, EINVAL, EIO, ENODEV, ENOENT, EOVERFLOW, EPIPE, ETIMEDOUT};
use rusb::{Context, DeviceHandle, TransferType};
use std::time::Duration;
use tracing::{debug, trace};

const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;
const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;
const USB_RECIP_INTERFACE: u8 = 0x01;
const USB_RECIP_ENDPOINT: u8 = 0x02;
const USB_ENDPOINT_HALT: u16 = 0x00;

/// Execute a request on an open device
pub fn execute_urb(device: &mut UsbDevice, urb: &UrbRequest, timeout: Duration) -> UrbCompletion {
    let endpoint = urb.endpoint_address();

    if urb.is_control() {
        let setup = urb.setup_packet();
        if let Some(completion) = intercept_standard_request(device, &setup) {
            return completion;
        }
        let Some(handle) = device.handle_mut() else {
            return UrbCompletion::error(ENODEV);
        };
        return execute_control_transfer(handle, &setup, urb, timeout);
    }

    let transfer_type = device.endpoint_type(endpoint);
    let Some(handle) = device.handle_mut() else {
        return UrbCompletion::error(ENODEV);
    };

    match transfer_type {
        Some(TransferType::Bulk) => execute_bulk_transfer(handle, endpoint, urb, timeout),
        Some(TransferType::Interrupt) => execute_interrupt_transfer(handle, endpoint, urb, timeout),
        Some(TransferType::Isochronous) => {
            debug!("Isochronous endpoint {:#04x} is not supported", endpoint);
            UrbCompletion::error(EINVAL)
        }
        Some(TransferType::Control) | None => {
            debug!("No bulk or interrupt endpoint {:#04x}", endpoint);
            UrbCompletion::error(EPIPE)
        }
    }
}

/// Standard requests that change host-side state go through the libusb API
/// instead of a raw control transfer.
fn intercept_standard_request(
    device: &mut UsbDevice,
    setup: &SetupPacket,
) -> Option<UrbCompletion> {
    if !setup.is_standard() || setup.is_in() {
        return None;
    }

    let handle = device.handle_mut()?;
    let result = match (setup.recipient(), setup.request) {
        (USB_RECIP_INTERFACE, USB_REQUEST_SET_INTERFACE) => {
            debug!("SET_INTERFACE interface={} alt={}", setup.index, setup.value);
            handle.set_alternate_setting(setup.index as u8, setup.value as u8)
        }
        (USB_RECIP_ENDPOINT, USB_REQUEST_CLEAR_FEATURE) if setup.value == USB_ENDPOINT_HALT => {
            debug!("CLEAR_FEATURE(halt) endpoint={:#04x}", setup.index);
            handle.clear_halt(setup.index as u8)
        }
        (0, USB_REQUEST_SET_CONFIGURATION) => {
            debug!("SET_CONFIGURATION {}", setup.value);
            handle.set_active_configuration(setup.value as u8)
        }
        _ => return None,
    };

    Some(match result {
        Ok(()) => {
            device.refresh_endpoints();
            UrbCompletion::written(0)
        }
        Err(e) => UrbCompletion::error(map_rusb_error(e)),
    })
}

fn execute_control_transfer(
    handle: &mut DeviceHandle<Context>,
    setup: &SetupPacket,
    urb: &UrbRequest,
    timeout: Duration,
) -> UrbCompletion {
    trace!(
        "Control transfer seq={}: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        urb.seqnum, setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    if setup.is_in() {
        let mut buffer = vec![0u8; usize::from(setup.length).min(urb.buffer_length as usize)];
        match handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buffer,
            timeout,
        ) {
            Ok(len) => {
                buffer.truncate(len);
                UrbCompletion::with_data(buffer)
            }
            Err(e) => failed("Control", urb.seqnum, e),
        }
    } else {
        match handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &urb.payload,
            timeout,
        ) {
            Ok(len) => UrbCompletion::written(len as u32),
            Err(e) => failed("Control", urb.seqnum, e),
        }
    }
}

fn execute_bulk_transfer(
    handle: &mut DeviceHandle<Context>,
    endpoint: u8,
    urb: &UrbRequest,
    timeout: Duration,
) -> UrbCompletion {
    trace!(
        "Bulk transfer seq={}: endpoint={:#x}, length={}",
        urb.seqnum, endpoint, urb.buffer_length
    );

    if urb.direction.is_in() {
        let mut buffer = vec![0u8; urb.buffer_length as usize];
        match handle.read_bulk(endpoint, &mut buffer, timeout) {
            Ok(len) => {
                buffer.truncate(len);
                UrbCompletion::with_data(buffer)
            }
            Err(e) => failed("Bulk", urb.seqnum, e),
        }
    } else {
        match handle.write_bulk(endpoint, &urb.payload, timeout) {
            Ok(len) => UrbCompletion::written(len as u32),
            Err(e) => failed("Bulk", urb.seqnum, e),
        }
    }
}

fn execute_interrupt_transfer(
    handle: &mut DeviceHandle<Context>,
    endpoint: u8,
    urb: &UrbRequest,
    timeout: Duration,
) -> UrbCompletion {
    trace!(
        "Interrupt transfer seq={}: endpoint={:#x}, length={}",
        urb.seqnum, endpoint, urb.buffer_length
    );

    if urb.direction.is_in() {
        let mut buffer = vec![0u8; urb.buffer_length as usize];
        match handle.read_interrupt(endpoint, &mut buffer, timeout) {
            Ok(len) => {
                buffer.truncate(len);
                UrbCompletion::with_data(buffer)
            }
            Err(e) => failed("Interrupt", urb.seqnum, e),
        }
    } else {
        match handle.write_interrupt(endpoint, &urb.payload, timeout) {
            Ok(len) => UrbCompletion::written(len as u32),
            Err(e) => failed("Interrupt", urb.seqnum, e),
        }
    }
}

fn failed(kind: &str, seqnum: u32, err: rusb::Error) -> UrbCompletion {
    debug!("{} transfer seq={} failed: {}", kind, seqnum, err);
    UrbCompletion::error(map_rusb_error(err))
}

/// Map a rusb error to the negative errno reported in RET_SUBMIT
pub fn map_rusb_error(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Timeout => ETIMEDOUT,
        rusb::Error::Pipe => EPIPE,
        rusb::Error::NoDevice => ENODEV,
        rusb::Error::NotFound => ENOENT,
        rusb::Error::Busy => EBUSY,
        rusb::Error::Overflow => EOVERFLOW,
        rusb::Error::InvalidParam => EINVAL,
        _ => EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), ETIMEDOUT);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), EPIPE);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), ENODEV);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), ENOENT);
        assert_eq!(map_rusb_error(rusb::Error::Overflow), EOVERFLOW);
        assert_eq!(map_rusb_error(rusb::Error::Io), EIO);
        assert_eq!(map_rusb_error(rusb::Error::Access), EIO);
    }

    #[test]
    fn test_failed_completion_carries_errno() {
        let completion = failed("Bulk", 3, rusb::Error::Pipe);
        assert_eq!(completion.status, EPIPE);
        assert_eq!(completion.actual_length, 0);
        assert!(completion.data.is_empty());
    }
}
