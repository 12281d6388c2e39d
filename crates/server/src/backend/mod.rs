//! Device backends
//!
//! A backend executes the USB requests of one imported device. The session
//! hands it every accepted SUBMIT together with a oneshot sender and expects
//! exactly one [`UrbCompletion`] back. A sender dropped without a reply is
//! reported to the client as `-ESHUTDOWN`.

pub mod loopback;
pub mod passthrough;

use common::{UrbCompletion, UrbRequest};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;

pub use loopback::{LoopbackDevice, LoopbackFactory};
pub use passthrough::{PassthroughDevice, PassthroughFactory, enumerate_exports};

/// Executes USB requests for one imported device
///
/// `submit` must not block; long-running work completes through `reply`.
pub trait DeviceBackend: Send + Sync {
    /// Start a request; the completion arrives on `reply`
    fn submit(&self, urb: UrbRequest, reply: oneshot::Sender<UrbCompletion>);

    /// Best-effort cancellation of the request with `seqnum`
    ///
    /// A cancelled request still completes through its reply sender,
    /// normally with `-ECONNRESET`.
    fn cancel(&self, seqnum: u32);

    /// Release device resources once the importing connection is gone
    fn release(&self);
}

/// Future returned by [`BackendFactory::open`]
pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = common::Result<Arc<dyn DeviceBackend>>> + Send + 'a>>;

/// Opens a backend for each successful import
pub trait BackendFactory: Send + Sync {
    fn open(&self) -> OpenFuture<'_>;
}
