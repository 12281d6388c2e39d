//! usbip-export server
//!
//! Exports virtual and host USB devices to USB/IP clients over TCP.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBridge, UsbCommand, create_usb_bridge, setup_logging};
use server::backend::enumerate_exports;
use server::usb::spawn_usb_worker;
use server::{DeviceRegistry, ServerConfig, UsbIpServer};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbip-server")]
#[command(author, version, about = "USB/IP server - export USB devices over TCP")]
#[command(long_about = "
A USB/IP device export server. Clients such as the Linux `usbip` tool list
the exported devices, attach one by bus id and then drive it as if it were
plugged in locally.

EXAMPLES:
    # Run with default config (virtual loopback device on port 3240)
    usbip-server

    # Run with custom config
    usbip-server --config /path/to/config.toml

    # List exported devices without starting the server
    usbip-server --list-devices

    # Listen on another address
    usbip-server --bind 127.0.0.1:3240

    # Run with debug logging
    usbip-server --log-level debug

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-export/server.toml
    3. /etc/usbip-export/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List exported devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Listen address, overrides the configured one
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
        config.validate().context("Invalid --bind address")?;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbip-export server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let registry = Arc::new(
        DeviceRegistry::from_config(&config).context("Failed to build device registry")?,
    );

    let usb = if config.usb.passthrough {
        let (bridge, worker) = create_usb_bridge();
        let handle = spawn_usb_worker(
            worker,
            config.usb.filters.clone(),
            config.usb.transfer_timeout(),
        )
        .context("Failed to spawn USB worker thread")?;

        match enumerate_exports(&bridge).await {
            Ok(exports) => {
                info!("Exporting {} host device(s)", exports.len());
                registry.add(exports);
            }
            Err(e) => warn!("Host device enumeration failed: {}", e),
        }
        Some((bridge, handle))
    } else {
        None
    };

    let result = if args.list_devices {
        list_devices(&registry);
        Ok(())
    } else {
        run_server(&config, Arc::clone(&registry)).await
    };

    if let Some((bridge, handle)) = usb {
        shutdown_usb_worker(bridge, handle).await;
    }

    result
}

/// Print the exported devices
fn list_devices(registry: &DeviceRegistry) {
    let devices = registry.list();

    if devices.is_empty() {
        println!("No exported devices.");
        return;
    }

    println!("Exporting {} device(s):\n", devices.len());
    for device in devices {
        let header = &device.header;
        println!(
            "  {} {:04x}:{:04x} ({} interface(s))",
            header.busid.to_string_lossy(),
            header.id_vendor,
            header.id_product,
            device.interfaces.len()
        );
        println!(
            "      Bus {:03} Device {:03} Speed: {:?}",
            header.busnum,
            header.devnum,
            protocol::DeviceSpeed::from_u32(header.speed)
        );
        println!("      Path: {}", header.path.to_string_lossy());
        println!();
    }
}

/// Serve clients until Ctrl+C
async fn run_server(config: &ServerConfig, registry: Arc<DeviceRegistry>) -> Result<()> {
    let server = UsbIpServer::bind(config, registry).await?;

    info!("Press Ctrl+C to shutdown");

    let mut server_handle = tokio::spawn(server.run());

    tokio::select! {
        joined = &mut server_handle => {
            return match joined {
                Ok(result) => result,
                Err(e) => Err(e).context("Server task failed"),
            };
        }
        signal = signal::ctrl_c() => match signal {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
    }

    server_handle.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Stop the USB worker thread and wait for it
async fn shutdown_usb_worker(bridge: UsbBridge, handle: JoinHandle<Result<(), rusb::Error>>) {
    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(UsbCommand::Shutdown).await {
        // The worker already exited, e.g. because libusb failed to initialise
        warn!("Failed to send Shutdown command: {}", e);
    }

    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("USB worker failed: {}", e),
        Ok(Err(e)) => error!("USB worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB worker: {}", e),
    }
}
