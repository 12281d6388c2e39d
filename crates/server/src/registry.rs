//! Exported device registry
//!
//! Holds the devices a client may list and import. Readers take a whole
//! snapshot, so a devlist reply never mixes two generations of the list.

use crate::backend::{BackendFactory, LoopbackFactory, loopback::LoopbackProfile};
use crate::config::{ImportPolicy, ServerConfig};
use anyhow::{Context, Result};
use protocol::DeviceSummary;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// A device offered to clients
pub struct ExportedDevice {
    pub summary: DeviceSummary,
    backend: Arc<dyn BackendFactory>,
}

impl ExportedDevice {
    pub fn new(summary: DeviceSummary, backend: Arc<dyn BackendFactory>) -> Self {
        Self { summary, backend }
    }

    pub fn bus_id(&self) -> Cow<'_, str> {
        self.summary.header.busid.to_string_lossy()
    }

    /// Device id transfer frames must carry after import
    pub fn devid(&self) -> u32 {
        self.summary.header.devid()
    }

    pub fn backend(&self) -> &Arc<dyn BackendFactory> {
        &self.backend
    }
}

impl fmt::Debug for ExportedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedDevice")
            .field("bus_id", &self.bus_id())
            .field("devid", &format_args!("{:#010x}", self.devid()))
            .finish()
    }
}

type Snapshot = Arc<Vec<Arc<ExportedDevice>>>;
type ClaimSet = Arc<Mutex<HashSet<String>>>;

/// Registry of exported devices, shared by all connections
pub struct DeviceRegistry {
    devices: RwLock<Snapshot>,
    policy: ImportPolicy,
    claims: ClaimSet,
}

impl DeviceRegistry {
    pub fn new(policy: ImportPolicy) -> Self {
        Self {
            devices: RwLock::new(Arc::new(Vec::new())),
            policy,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_devices(policy: ImportPolicy, devices: Vec<ExportedDevice>) -> Self {
        let registry = Self::new(policy);
        registry.add(devices);
        registry
    }

    /// Build a registry holding the configured loopback devices
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut devices = Vec::with_capacity(config.devices.len());
        for entry in &config.devices {
            let profile = LoopbackProfile::from(entry);
            let summary = profile
                .summary(&entry.bus_id, &entry.sysfs_path(), entry.busnum, entry.devnum)
                .with_context(|| format!("Invalid device entry '{}'", entry.bus_id))?;
            devices.push(ExportedDevice::new(
                summary,
                Arc::new(LoopbackFactory::new(profile)),
            ));
        }

        info!("Registered {} virtual device(s)", devices.len());
        Ok(Self::with_devices(config.export.import_policy, devices))
    }

    /// Current generation of the device list
    pub fn snapshot(&self) -> Snapshot {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the whole device list
    pub fn replace(&self, devices: Vec<ExportedDevice>) {
        let next: Vec<Arc<ExportedDevice>> = devices.into_iter().map(Arc::new).collect();
        *self.devices.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    /// Append devices, skipping bus ids that are already exported
    pub fn add(&self, devices: Vec<ExportedDevice>) {
        let mut guard = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<Arc<ExportedDevice>> = guard.as_ref().clone();
        for device in devices {
            if next.iter().any(|d| d.summary.header.busid == device.summary.header.busid) {
                warn!("Skipping duplicate bus id {}", device.bus_id());
                continue;
            }
            debug!("Exporting {:?}", device);
            next.push(Arc::new(device));
        }
        *guard = Arc::new(next);
    }

    /// Summaries of every exported device
    pub fn list(&self) -> Vec<DeviceSummary> {
        self.snapshot().iter().map(|d| d.summary.clone()).collect()
    }

    /// Look up a device by bus id
    pub fn describe(&self, bus_id: &str) -> Option<Arc<ExportedDevice>> {
        self.snapshot()
            .iter()
            .find(|d| d.summary.header.busid.matches(bus_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn policy(&self) -> ImportPolicy {
        self.policy
    }

    /// Claim a device for one connection
    ///
    /// Always succeeds under [`ImportPolicy::Shared`]. Under
    /// [`ImportPolicy::Exclusive`] returns `None` while another connection
    /// holds the device.
    pub fn claim(&self, bus_id: &str) -> Option<ImportClaim> {
        match self.policy {
            ImportPolicy::Shared => Some(ImportClaim {
                bus_id: None,
                claims: Arc::clone(&self.claims),
            }),
            ImportPolicy::Exclusive => {
                let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
                if !claims.insert(bus_id.to_string()) {
                    return None;
                }
                Some(ImportClaim {
                    bus_id: Some(bus_id.to_string()),
                    claims: Arc::clone(&self.claims),
                })
            }
        }
    }

    pub fn is_claimed(&self, bus_id: &str) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(bus_id)
    }
}

/// Held by a connection for as long as it has a device imported
///
/// Dropping the claim frees the device for the next exclusive import.
pub struct ImportClaim {
    bus_id: Option<String>,
    claims: ClaimSet,
}

impl Drop for ImportClaim {
    fn drop(&mut self) {
        if let Some(bus_id) = self.bus_id.take() {
            debug!("Releasing import claim on {}", bus_id);
            self.claims
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&bus_id);
        }
    }
}
