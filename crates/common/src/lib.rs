//! Common utilities for usbip-export
//!
//! This crate provides functionality shared by the server and its tests,
//! including USB request/completion types, error handling, logging setup,
//! and the async channel bridge for USB thread communication.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{UsbBridge, UsbCommand, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceAddress, HostDevice, SetupPacket, UrbCompletion, UrbRequest};
