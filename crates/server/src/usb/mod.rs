//! Host USB subsystem
//!
//! Enumerates host devices, opens them for export and executes transfers
//! through libusb. Everything runs on a dedicated worker thread so blocking
//! libusb calls never stall the Tokio runtime.

pub mod device;
pub mod transfers;
pub mod worker;

pub use device::{UsbDevice, check_filter};
pub use worker::{UsbWorkerThread, spawn_usb_worker};
