//! USB worker thread
//!
//! Dedicated blocking thread that owns the libusb context and every open
//! device handle. The Tokio side talks to it through the [`UsbWorker`]
//! channel bridge.
//!
//! Each open device has a FIFO of pending transfers. The loop runs one
//! transfer per device per turn and only blocks on the command channel when
//! every queue is empty, so a cancel can overtake transfers that have not
//! started yet.

use crate::usb::device::{UsbDevice, check_filter};
use crate::usb::transfers::execute_urb;
use common::{DeviceAddress, HostDevice, UrbCompletion, UrbRequest, UsbCommand, UsbWorker};
use rusb::{Context, UsbContext};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

struct QueuedUrb {
    session: u64,
    urb: UrbRequest,
    response: oneshot::Sender<UrbCompletion>,
}

struct OpenDevice {
    device: UsbDevice,
    /// Number of imports holding the device open
    opens: usize,
    queue: VecDeque<QueuedUrb>,
}

/// USB worker thread state
pub struct UsbWorkerThread {
    context: Context,
    worker: UsbWorker,
    filters: Vec<String>,
    transfer_timeout: Duration,
    devices: HashMap<DeviceAddress, OpenDevice>,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        filters: Vec<String>,
        transfer_timeout: Duration,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;

        Ok(Self {
            context,
            worker,
            filters,
            transfer_timeout,
            devices: HashMap::new(),
        })
    }

    /// Run until a Shutdown command arrives or the bridge is dropped
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            let command = if self.has_queued_transfers() {
                self.worker.try_recv_command()
            } else {
                match self.worker.recv_command() {
                    Ok(cmd) => Some(cmd),
                    Err(e) => {
                        debug!("USB command channel closed: {}", e);
                        break;
                    }
                }
            };

            match command {
                Some(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            self.run_queued_transfers();
        }

        self.close_all();
        info!("USB worker thread stopped");
        Ok(())
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        // A panicking handler must not take the USB thread down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::OpenDevice { device, response } => {
                let _ = response.send(self.open_device(device));
            }

            UsbCommand::SubmitUrb {
                device,
                session,
                urb,
                response,
            } => match self.devices.get_mut(&device) {
                Some(open) => open.queue.push_back(QueuedUrb {
                    session,
                    urb,
                    response,
                }),
                None => {
                    warn!("Transfer seq={} for closed device {}", urb.seqnum, device);
                    let _ = response.send(UrbCompletion::error(protocol::status::ENODEV));
                }
            },

            UsbCommand::CancelUrb {
                device,
                session,
                seqnum,
                response,
            } => {
                let removed = self
                    .devices
                    .get_mut(&device)
                    .and_then(|open| {
                        let index = open
                            .queue
                            .iter()
                            .position(|q| q.session == session && q.urb.seqnum == seqnum)?;
                        open.queue.remove(index)
                    })
                    .map(|queued| {
                        debug!("Cancelled queued transfer seq={} on {}", seqnum, device);
                        let _ = queued.response.send(UrbCompletion::cancelled());
                    })
                    .is_some();
                let _ = response.send(removed);
            }

            UsbCommand::CloseDevice { device, response } => {
                self.close_device(device);
                let _ = response.send(());
            }

            UsbCommand::Shutdown => {}
        }
    }

    /// Enumerate exportable host devices
    ///
    /// Root hubs and devices rejected by the filters are skipped.
    fn list_devices(&self) -> Vec<HostDevice> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .iter()
            .filter_map(|device| UsbDevice::new(device).ok())
            .filter(|device| {
                if device.is_root_hub() {
                    debug!("Skipping root hub {}", device.address());
                    return false;
                }
                check_filter(device.vendor_id(), device.product_id(), &self.filters)
            })
            .map(|device| device.host_device())
            .collect()
    }

    fn open_device(&mut self, address: DeviceAddress) -> common::Result<()> {
        if let Some(open) = self.devices.get_mut(&address) {
            open.opens += 1;
            debug!("Device {} now opened {} times", address, open.opens);
            return Ok(());
        }

        let found = self
            .context
            .devices()
            .map_err(|e| common::Error::Usb(e.to_string()))?
            .iter()
            .find(|d| d.bus_number() == address.bus && d.address() == address.address)
            .ok_or_else(|| common::Error::Usb(format!("device {} not found", address)))?;

        let mut device = UsbDevice::new(found).map_err(|e| common::Error::Usb(e.to_string()))?;
        if !check_filter(device.vendor_id(), device.product_id(), &self.filters) {
            return Err(common::Error::Usb(format!(
                "device {} is not allowed by the filters",
                address
            )));
        }
        device.open()?;

        info!("Opened host device {}", address);
        self.devices.insert(
            address,
            OpenDevice {
                device,
                opens: 1,
                queue: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn close_device(&mut self, address: DeviceAddress) {
        let Some(open) = self.devices.get_mut(&address) else {
            debug!("Close of device {} that is not open", address);
            return;
        };

        open.opens = open.opens.saturating_sub(1);
        if open.opens > 0 {
            return;
        }

        if let Some(mut open) = self.devices.remove(&address) {
            for queued in open.queue.drain(..) {
                let _ = queued
                    .response
                    .send(UrbCompletion::error(protocol::status::ESHUTDOWN));
            }
            open.device.close();
            info!("Closed host device {}", address);
        }
    }

    fn close_all(&mut self) {
        let addresses: Vec<DeviceAddress> = self.devices.keys().copied().collect();
        for address in addresses {
            if let Some(open) = self.devices.get_mut(&address) {
                open.opens = 1;
            }
            self.close_device(address);
        }
    }

    fn has_queued_transfers(&self) -> bool {
        self.devices.values().any(|open| !open.queue.is_empty())
    }

    /// Run the head transfer of every device queue
    fn run_queued_transfers(&mut self) {
        let timeout = self.transfer_timeout;
        for open in self.devices.values_mut() {
            let Some(queued) = open.queue.pop_front() else {
                continue;
            };
            if queued.response.is_closed() {
                debug!("Dropping transfer seq={}, requester gone", queued.urb.seqnum);
                continue;
            }
            let completion = execute_urb(&mut open.device, &queued.urb, timeout);
            let _ = queued.response.send(completion);
        }
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or every bridge
/// handle is dropped.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    filters: Vec<String>,
    transfer_timeout: Duration,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, filters, transfer_timeout)?;
            worker_thread.run()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_usb_bridge;

    #[test]
    fn test_usb_worker_creation() {
        let (_bridge, worker) = create_usb_bridge();

        // Context creation may fail without USB permissions
        match UsbWorkerThread::new(worker, vec![], Duration::from_secs(1)) {
            Ok(thread) => assert!(!thread.has_queued_transfers()),
            Err(e) => eprintln!(
                "USB worker creation failed (expected without permissions): {}",
                e
            ),
        }
    }

    #[test]
    fn test_worker_exits_when_bridge_dropped() {
        let (bridge, worker) = create_usb_bridge();
        let handle = spawn_usb_worker(worker, vec![], Duration::from_secs(1)).unwrap();
        drop(bridge);

        // Either the context failed to initialise or the loop saw the closed channel
        let _ = handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_submit_to_unopened_device_fails() {
        let (bridge, worker) = create_usb_bridge();
        let handle = spawn_usb_worker(worker, vec![], Duration::from_secs(1)).unwrap();

        let (tx, rx) = oneshot::channel();
        let sent = bridge
            .send_command(UsbCommand::SubmitUrb {
                device: DeviceAddress { bus: 9, address: 9 },
                session: 1,
                urb: common::test_utils::create_mock_urb(1, protocol::Direction::In, 1, 8),
                response: tx,
            })
            .await;

        // Without libusb access the worker is already gone
        if sent.is_ok()
            && let Ok(completion) = rx.await
        {
            assert_eq!(completion.status, protocol::status::ENODEV);
        }

        let _ = bridge.send_command(UsbCommand::Shutdown).await;
        let _ = handle.join();
    }
}
