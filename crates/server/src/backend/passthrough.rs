//! Host device passthrough
//!
//! Exports real USB devices. Every request is forwarded over the
//! [`UsbBridge`] to the USB worker thread, which runs transfers in order on
//! the device handle it owns.
//!
//! Ordering is per device, not per endpoint: a bulk or interrupt IN waiting
//! on an idle device holds back everything queued behind it, control
//! transfers included, for up to `usb.transfer_timeout_ms`. Clients that keep
//! an interrupt IN outstanding see their control requests answered only when
//! that read completes or times out.

use super::{BackendFactory, DeviceBackend, OpenFuture};
use crate::registry::ExportedDevice;
use common::{DeviceAddress, UrbCompletion, UrbRequest, UsbBridge, UsbCommand};
use protocol::status::ESHUTDOWN;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// One import of a host device
///
/// Commands go through a forwarding task so they reach the worker in the
/// order the session issued them.
pub struct PassthroughDevice {
    address: DeviceAddress,
    session: u64,
    commands: mpsc::UnboundedSender<UsbCommand>,
    released: AtomicBool,
}

impl PassthroughDevice {
    /// Start forwarding to `bridge`; must be called inside a Tokio runtime
    pub fn spawn(bridge: UsbBridge, address: DeviceAddress) -> Self {
        let (commands, mut rx) = mpsc::unbounded_channel::<UsbCommand>();

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let Err(e) = bridge.send_command(cmd).await {
                    warn!("USB worker unreachable for {}: {}", address, e);
                    break;
                }
            }
            debug!("Forwarder for {} finished", address);
        });

        Self {
            address,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            commands,
            released: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    fn forward(&self, cmd: UsbCommand) {
        // A closed forwarder drops the command and with it any reply sender
        let _ = self.commands.send(cmd);
    }
}

impl DeviceBackend for PassthroughDevice {
    fn submit(&self, urb: UrbRequest, reply: oneshot::Sender<UrbCompletion>) {
        if self.released.load(Ordering::Acquire) {
            let _ = reply.send(UrbCompletion::error(ESHUTDOWN));
            return;
        }

        trace!("Forwarding seq={} to {}", urb.seqnum, self.address);
        self.forward(UsbCommand::SubmitUrb {
            device: self.address,
            session: self.session,
            urb,
            response: reply,
        });
    }

    fn cancel(&self, seqnum: u32) {
        let (response, _) = oneshot::channel();
        self.forward(UsbCommand::CancelUrb {
            device: self.address,
            session: self.session,
            seqnum,
            response,
        });
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("Releasing host device {}", self.address);
        let (response, _) = oneshot::channel();
        self.forward(UsbCommand::CloseDevice {
            device: self.address,
            response,
        });
    }
}

/// Opens a host device on the USB worker for each import
pub struct PassthroughFactory {
    bridge: UsbBridge,
    address: DeviceAddress,
}

impl PassthroughFactory {
    pub fn new(bridge: UsbBridge, address: DeviceAddress) -> Self {
        Self { bridge, address }
    }
}

impl BackendFactory for PassthroughFactory {
    fn open(&self) -> OpenFuture<'_> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            self.bridge
                .send_command(UsbCommand::OpenDevice {
                    device: self.address,
                    response: tx,
                })
                .await?;

            rx.await
                .map_err(|_| common::Error::Channel("USB worker dropped open request".into()))??;

            let device: Arc<dyn DeviceBackend> =
                Arc::new(PassthroughDevice::spawn(self.bridge.clone(), self.address));
            Ok(device)
        })
    }
}

/// Ask the USB worker for host devices and wrap them for export
///
/// Devices whose bus id or path does not fit the wire format are skipped.
pub async fn enumerate_exports(bridge: &UsbBridge) -> common::Result<Vec<ExportedDevice>> {
    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await?;
    let devices = rx
        .await
        .map_err(|_| common::Error::Channel("USB worker dropped list request".into()))?;

    let mut exports = Vec::with_capacity(devices.len());
    for device in devices {
        match device.summary() {
            Ok(summary) => {
                info!(
                    "Found host device {} ({:04x}:{:04x}) at {}",
                    device.bus_id, device.vendor_id, device.product_id, device.address
                );
                exports.push(ExportedDevice::new(
                    summary,
                    Arc::new(PassthroughFactory::new(bridge.clone(), device.address)),
                ));
            }
            Err(e) => warn!("Skipping host device {}: {}", device.bus_id, e),
        }
    }

    Ok(exports)
}
