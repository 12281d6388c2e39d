//! USB/IP export server
//!
//! Exports USB devices to USB/IP clients over TCP. A client lists the
//! exported devices, imports one by bus id, and then drives it with URB
//! SUBMIT/UNLINK frames that the server hands to a device backend.
//!
//! # Architecture
//!
//! ```text
//! TcpListener ──► Connection ──► handshake ──► UrbSession ──► DeviceBackend
//!                    │                             │             ├─ LoopbackDevice
//!                    └──── writer task ◄── completions            └─ PassthroughDevice ─► usb worker thread
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod usb;

pub use config::{ImportPolicy, ServerConfig};
pub use connection::{Connection, ConnectionSettings};
pub use error::{ConnectionError, Violation};
pub use registry::{DeviceRegistry, ExportedDevice};
pub use server::UsbIpServer;
pub use session::{SessionLimits, UrbSession};
