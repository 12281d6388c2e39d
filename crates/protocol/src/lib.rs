//! USB/IP wire protocol
//!
//! This crate defines the binary messages exchanged between a USB/IP client
//! and an exporting server. It provides typed structures for the handshake
//! (device list and import) and the transfer phase (URB submit and unlink),
//! with exact big-endian encoding and decoding.
//!
//! # Example
//!
//! ```
//! use protocol::{BusId, ControlHeader, FixedFrame, OpCode, OpReqImport};
//!
//! let request = OpReqImport {
//!     busid: BusId::new("1-1").unwrap(),
//! };
//! let bytes = request.encode_request().unwrap();
//! assert_eq!(bytes.len(), ControlHeader::SIZE + OpReqImport::SIZE);
//!
//! let header = ControlHeader::decode(&bytes).unwrap();
//! assert_eq!(header.op_code().unwrap(), OpCode::ReqImport);
//! ```
//!
//! # Transfer Frames
//!
//! Transfer frames start with a fixed 48-byte block; any payload and
//! isochronous descriptors follow it:
//!
//! ```
//! use protocol::{Command, Direction, MessageHeader, SubmitBody, SubmitFrame, UrbFrame};
//!
//! let frame = UrbFrame::Submit(SubmitFrame {
//!     header: MessageHeader::new(Command::Submit, 1, 0x0001_0002, Direction::Out, 2),
//!     body: SubmitBody {
//!         transfer_buffer_length: 3,
//!         ..Default::default()
//!     },
//!     payload: vec![1, 2, 3],
//!     iso_packets: Vec::new(),
//! });
//!
//! let bytes = frame.encode().unwrap();
//! let (decoded, used) = UrbFrame::decode(&bytes).unwrap();
//! assert_eq!(used, 48 + 3);
//! assert_eq!(decoded, frame);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod status;
pub mod transfer;
pub mod types;
pub mod version;

pub use codec::{FixedFrame, MAX_ISO_PACKETS, MAX_TRANSFER_SIZE, ensure_len};

#[cfg(feature = "async")]
pub use codec::{read_exact_async, read_fixed_async, read_fixed_or_eof_async, write_frame_async};
pub use error::{ProtocolError, Result};
pub use messages::{
    ControlHeader, DeviceSummary, DeviceSummaryHeader, InterfaceSummary, OpCode, OpRepDevlist,
    OpRepImport, OpReqImport,
};
pub use transfer::{
    Command, MessageHeader, RetSubmitBody, RetSubmitFrame, RetUnlinkBody, RetUnlinkFrame,
    SubmitBody, SubmitFrame, UnlinkBody, UnlinkFrame, UrbBody, UrbFrame, UrbPrefix,
    is_iso_packet_count,
};
pub use types::{
    BusId, DeviceSpeed, Direction, FixedString, IsoPacketDescriptor, UsbPath, device_id,
};
pub use version::{CURRENT_VERSION, ProtocolVersion, USBIP_VERSION};
