//! USB/IP TCP server
//!
//! Accepts client connections and spawns one connection driver per peer.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionSettings};
use crate::error::ConnectionError;
use crate::registry::DeviceRegistry;

/// USB/IP server bound to a TCP port
pub struct UsbIpServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    settings: ConnectionSettings,
}

impl UsbIpServer {
    /// Bind the listening socket
    ///
    /// # Arguments
    /// * `config` - Server configuration (bind address, session limits)
    /// * `registry` - Devices offered to clients
    pub async fn bind(config: &ServerConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(&config.server.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

        info!(
            "Listening on {} with {} exported device(s)",
            listener.local_addr()?,
            registry.len()
        );

        Ok(Self {
            listener,
            registry,
            settings: ConnectionSettings::from(config),
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Accept connections until the task is cancelled
    ///
    /// Each connection runs on its own task; a failing connection never
    /// stops the accept loop.
    pub async fn run(self) -> Result<()> {
        info!("Server running, waiting for connections...");

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            info!("Accepted connection from {}", peer);

            let connection = Connection::new(
                stream,
                peer.to_string(),
                Arc::clone(&self.registry),
                self.settings,
            );

            tokio::spawn(async move {
                match connection.run().await {
                    Ok(()) => {}
                    Err(e @ ConnectionError::Io(_)) => {
                        error!("Connection error from {}: {:#}", peer, e);
                    }
                    Err(e) => warn!("Closed connection from {}: {}", peer, e),
                }
                debug!("Connection task for {} finished", peer);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportPolicy;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let mut config = ServerConfig::default();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        let registry = Arc::new(DeviceRegistry::new(ImportPolicy::Shared));

        let server = UsbIpServer::bind(&config, registry).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_invalid_address_fails() {
        let mut config = ServerConfig::default();
        config.server.bind_addr = "not-an-address".to_string();
        let registry = Arc::new(DeviceRegistry::new(ImportPolicy::Shared));

        assert!(UsbIpServer::bind(&config, registry).await.is_err());
    }
}
