//! Server configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{BusId, DeviceSpeed, UsbPath};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default USB/IP TCP port
pub const DEFAULT_PORT: u16 = 3240;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    /// Per-connection URB limits and grace periods
    #[serde(default)]
    pub session: SessionSettings,
    /// Import policy
    #[serde(default)]
    pub export: ExportSettings,
    /// Host device passthrough
    #[serde(default)]
    pub usb: UsbSettings,
    /// Virtual loopback devices to export
    #[serde(default)]
    pub devices: Vec<VirtualDeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub log_level: String,
    /// Seconds an unbound connection may stay silent before it is closed
    #[serde(default = "ServerSettings::default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl ServerSettings {
    fn default_handshake_timeout() -> u64 {
        30
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Outstanding SUBMITs per connection before new ones get -ENOMEM
    #[serde(default = "SessionSettings::default_max_pending")]
    pub max_pending_urbs: usize,
    /// How long an UNLINK waits for the backend before it is answered anyway
    #[serde(default = "SessionSettings::default_unlink_grace")]
    pub unlink_grace_ms: u64,
    /// How long teardown waits for in-flight requests before releasing the backend
    #[serde(default = "SessionSettings::default_teardown_grace")]
    pub teardown_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_pending_urbs: Self::default_max_pending(),
            unlink_grace_ms: Self::default_unlink_grace(),
            teardown_grace_ms: Self::default_teardown_grace(),
        }
    }
}

impl SessionSettings {
    fn default_max_pending() -> usize {
        1024
    }

    fn default_unlink_grace() -> u64 {
        500
    }

    fn default_teardown_grace() -> u64 {
        2000
    }
}

/// Whether several connections may import the same device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImportPolicy {
    /// Any number of connections may import a device
    #[default]
    Shared,
    /// One connection at a time; others get `ST_DEV_BUSY`
    Exclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExportSettings {
    #[serde(default)]
    pub import_policy: ImportPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Export host USB devices through libusb
    #[serde(default)]
    pub passthrough: bool,
    /// VID:PID filters for passthrough devices (empty = all)
    #[serde(default)]
    pub filters: Vec<String>,
    /// Timeout for a single host transfer
    #[serde(default = "UsbSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            passthrough: false,
            filters: Vec::new(),
            transfer_timeout_ms: Self::default_transfer_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_transfer_timeout() -> u64 {
        5000
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// A virtual loopback device entry
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// bus_id = "1-1"
/// busnum = 1
/// devnum = 2
/// speed = "high"
/// vendor_id = 0x1d6b
/// product_id = 0x0104
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    pub bus_id: String,
    /// Reported sysfs path; derived from the bus id when absent
    #[serde(default)]
    pub path: Option<String>,
    pub busnum: u32,
    pub devnum: u32,
    #[serde(default)]
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            bus_id: "1-1".to_string(),
            path: None,
            busnum: 1,
            devnum: 2,
            speed: DeviceSpeed::High,
            vendor_id: 0x1d6b,
            product_id: 0x0104,
        }
    }
}

impl VirtualDeviceConfig {
    /// Sysfs path reported in device summaries
    pub fn sysfs_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/sys/devices/usbip-export/{}", self.bus_id))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
                log_level: "info".to_string(),
                handshake_timeout_secs: ServerSettings::default_handshake_timeout(),
            },
            session: SessionSettings::default(),
            export: ExportSettings::default(),
            usb: UsbSettings::default(),
            devices: vec![VirtualDeviceConfig::default()],
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the user config directory and then `/etc` are tried.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-export/server.toml"),
            ];
            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-export").join("server.toml")
        } else {
            PathBuf::from(".config/usbip-export/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_addr))?;

        if self.server.handshake_timeout_secs == 0 {
            return Err(anyhow!("handshake_timeout_secs must be greater than 0"));
        }

        if self.session.max_pending_urbs == 0 {
            return Err(anyhow!("max_pending_urbs must be greater than 0"));
        }

        // Validate USB filters (VID:PID format)
        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let mut bus_ids = HashSet::new();
        for device in &self.devices {
            Self::validate_device(device)?;
            if !bus_ids.insert(device.bus_id.as_str()) {
                return Err(anyhow!("Duplicate device bus id '{}'", device.bus_id));
            }
        }

        Ok(())
    }

    /// Validate a virtual device entry against the wire field widths
    fn validate_device(device: &VirtualDeviceConfig) -> Result<()> {
        if device.bus_id.is_empty() {
            return Err(anyhow!("Empty bus id in [[devices]]"));
        }

        BusId::new(&device.bus_id)
            .map_err(|e| anyhow!("Invalid bus id '{}': {}", device.bus_id, e))?;
        UsbPath::new(&device.sysfs_path())
            .map_err(|e| anyhow!("Invalid path for device '{}': {}", device.bus_id, e))?;

        if device.busnum > 0xffff || device.devnum > 0xffff {
            return Err(anyhow!(
                "Device '{}' busnum/devnum must fit in 16 bits",
                device.bus_id
            ));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub(crate) fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        // Validate VID
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        // Validate PID
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
