//! Host USB device wrapper
//!
//! Wraps a `rusb::Device` with its cached descriptor, the interfaces we
//! claimed and the transfer type of every endpoint in the active
//! configuration.

use common::{DeviceAddress, HostDevice};
use protocol::DeviceSpeed;
use rusb::{ConfigDescriptor, Context, Device, DeviceDescriptor, DeviceHandle, TransferType};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Vendor id of the Linux Foundation root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

/// USB device wrapper with cached information
pub struct UsbDevice {
    device: Device<Context>,
    address: DeviceAddress,
    descriptor: DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    claimed_interfaces: Vec<u8>,
    /// Endpoint address (with direction bit) to transfer type
    endpoints: HashMap<u8, TransferType>,
}

impl UsbDevice {
    /// Reads and caches the device descriptor
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let address = DeviceAddress {
            bus: device.bus_number(),
            address: device.address(),
        };

        Ok(Self {
            device,
            address,
            descriptor,
            handle: None,
            claimed_interfaces: Vec::new(),
            endpoints: HashMap::new(),
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    /// Root hubs are never exported
    pub fn is_root_hub(&self) -> bool {
        self.descriptor.vendor_id() == ROOT_HUB_VENDOR_ID
            && self.descriptor.class_code() == HUB_CLASS
    }

    /// Port path bus id, `<bus>-<port>[.<port>...]`
    pub fn bus_id(&self) -> String {
        let ports = self.device.port_numbers().unwrap_or_default();
        format_bus_id(self.address.bus, &ports)
    }

    /// Describe the device for the export list
    pub fn host_device(&self) -> HostDevice {
        let (configuration_value, interfaces) = match self.device.active_config_descriptor() {
            Ok(config) => {
                let interfaces = config
                    .interfaces()
                    .filter_map(|interface| interface.descriptors().next())
                    .map(|alt| (alt.class_code(), alt.sub_class_code(), alt.protocol_code()))
                    .collect();
                (config.number(), interfaces)
            }
            Err(e) => {
                debug!("No active configuration on {}: {}", self.address, e);
                (0, Vec::new())
            }
        };

        let version = self.descriptor.device_version();
        let bcd_device = (u16::from(version.major()) << 8)
            | (u16::from(version.minor()) << 4)
            | u16::from(version.sub_minor());

        HostDevice {
            address: self.address,
            bus_id: self.bus_id(),
            speed: map_device_speed(self.device.speed()),
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bcd_device,
            class: self.descriptor.class_code(),
            subclass: self.descriptor.sub_class_code(),
            protocol: self.descriptor.protocol_code(),
            configuration_value,
            num_configurations: self.descriptor.num_configurations(),
            interfaces,
        }
    }

    /// Open the device for transfers
    ///
    /// Detaches kernel drivers and claims every interface of the active
    /// configuration. Interfaces claimed before a failure are released again.
    pub fn open(&mut self) -> common::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let mut handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.address, e);
            common::Error::Usb(format!("open {}: {}", self.address, e))
        })?;

        let config = self
            .device
            .active_config_descriptor()
            .map_err(|e| common::Error::Usb(format!("config descriptor: {}", e)))?;

        for interface in config.interfaces() {
            let number = interface.number();

            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    if let Err(e) = handle.detach_kernel_driver(number) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            number, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("Kernel driver state of interface {}: {}", number, e),
            }

            if let Err(e) = handle.claim_interface(number) {
                warn!("Failed to claim interface {}: {}", number, e);
                self.handle = Some(handle);
                self.close();
                return Err(common::Error::Usb(format!(
                    "claim interface {}: {}",
                    number, e
                )));
            }

            debug!("Claimed interface {} on {}", number, self.address);
            self.claimed_interfaces.push(number);
        }

        self.endpoints = collect_endpoints(&config);
        self.handle = Some(handle);
        Ok(())
    }

    /// Release claimed interfaces and give them back to the kernel
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            for interface in self.claimed_interfaces.drain(..) {
                if let Err(e) = handle.release_interface(interface) {
                    warn!("Failed to release interface {}: {}", interface, e);
                }
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    );
                }
            }
            self.endpoints.clear();
            debug!("Closed device {}", self.address);
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns `None` if the device is not open
    pub fn handle_mut(&mut self) -> Option<&mut DeviceHandle<Context>> {
        self.handle.as_mut()
    }

    /// Transfer type of an endpoint in the active configuration
    pub fn endpoint_type(&self, endpoint_address: u8) -> Option<TransferType> {
        if endpoint_address & 0x0f == 0 {
            return Some(TransferType::Control);
        }
        self.endpoints.get(&endpoint_address).copied()
    }

    /// Re-read endpoint types after SET_CONFIGURATION or SET_INTERFACE
    pub fn refresh_endpoints(&mut self) {
        if let Ok(config) = self.device.active_config_descriptor() {
            self.endpoints = collect_endpoints(&config);
        }
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn collect_endpoints(config: &ConfigDescriptor) -> HashMap<u8, TransferType> {
    config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .flat_map(|alt| {
            alt.endpoint_descriptors()
                .map(|ep| (ep.address(), ep.transfer_type()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn format_bus_id(bus: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return format!("{}-0", bus);
    }
    let path: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
    format!("{}-{}", bus, path.join("."))
}

/// Map rusb device speed to the wire speed
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Check a VID/PID pair against `0xVID:0xPID` filters (`*` matches any)
///
/// No filters means every device is allowed.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
    })
}

fn id_matches(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let digits = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(digits, 16)
        .map(|v| v == id)
        .unwrap_or(false)
}
