//! Status codes carried on the wire
//!
//! Handshake replies use the USB/IP operation status codes. URB completions
//! carry negated Linux errno values, the way the kernel's vhci_hcd driver
//! expects them in `RET_SUBMIT.status` and `RET_UNLINK.status`.

/// Request completed
pub const ST_OK: u32 = 0x00;
/// Device not available
pub const ST_NA: u32 = 0x01;
/// Device busy (already exported to another importer)
pub const ST_DEV_BUSY: u32 = 0x02;
/// Device in error state
pub const ST_DEV_ERR: u32 = 0x03;
/// Device not found
pub const ST_NODEV: u32 = 0x04;
/// Unexpected response
pub const ST_ERROR: u32 = 0x05;

/// URB completed successfully
pub const URB_OK: i32 = 0;

pub const ENOENT: i32 = -2;
pub const EIO: i32 = -5;
pub const ENOMEM: i32 = -12;
pub const EBUSY: i32 = -16;
pub const ENODEV: i32 = -19;
pub const EINVAL: i32 = -22;
pub const EPIPE: i32 = -32;
pub const EOVERFLOW: i32 = -75;
pub const ECONNRESET: i32 = -104;
pub const ESHUTDOWN: i32 = -108;
pub const ETIMEDOUT: i32 = -110;

/// `RET_UNLINK` status for a request that was cancelled
pub const UNLINK_CANCELLED: i32 = URB_OK;
/// `RET_UNLINK` status when the target already completed or never existed
pub const UNLINK_NOT_FOUND: i32 = ENOENT;

/// Short name of an errno status, for logs
pub fn errno_name(status: i32) -> &'static str {
    match status {
        URB_OK => "OK",
        ENOENT => "ENOENT",
        EIO => "EIO",
        ENOMEM => "ENOMEM",
        EBUSY => "EBUSY",
        ENODEV => "ENODEV",
        EINVAL => "EINVAL",
        EPIPE => "EPIPE",
        EOVERFLOW => "EOVERFLOW",
        ECONNRESET => "ECONNRESET",
        ESHUTDOWN => "ESHUTDOWN",
        ETIMEDOUT => "ETIMEDOUT",
        _ => "EUNKNOWN",
    }
}
