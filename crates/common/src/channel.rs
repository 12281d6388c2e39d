//! Async channel bridge between Tokio runtime and USB thread

use crate::usb_types::{DeviceAddress, HostDevice, UrbCompletion, UrbRequest};
use async_channel::{Receiver, Sender, bounded};
use tokio::sync::oneshot;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List host devices that pass the configured filters
    ListDevices {
        /// Channel to send response back
        response: oneshot::Sender<Vec<HostDevice>>,
    },

    /// Open a device, detaching kernel drivers and claiming its interfaces
    OpenDevice {
        device: DeviceAddress,
        /// Channel to send response back
        response: oneshot::Sender<crate::Result<()>>,
    },

    /// Queue a USB request on an open device
    SubmitUrb {
        device: DeviceAddress,
        /// Identifies the importing session; seqnums are only unique per session
        session: u64,
        urb: UrbRequest,
        /// Receives the completion once the request ran or was cancelled
        response: oneshot::Sender<UrbCompletion>,
    },

    /// Cancel a queued request that has not started yet
    CancelUrb {
        device: DeviceAddress,
        session: u64,
        seqnum: u32,
        /// `true` when the request was removed from the queue
        response: oneshot::Sender<bool>,
    },

    /// Release interfaces, reattach kernel drivers and close the handle
    CloseDevice {
        device: DeviceAddress,
        /// Channel to send response back
        response: oneshot::Sender<()>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// True once the USB thread has dropped its end
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);

    (UsbBridge { cmd_tx }, UsbWorker { cmd_rx })
}
