//! Client connection driver
//!
//! Runs the handshake, then splits the stream: the read path decodes SUBMIT
//! and UNLINK frames into the session while a writer task drains reply
//! frames. The reply queue is bounded, so a peer that stops reading stalls
//! the read path instead of growing it. Whatever ends the connection (peer
//! close, malformed frame, violation, I/O error), the session is torn down
//! before returning.

use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::handshake::{self, HandshakeOutcome};
use crate::registry::DeviceRegistry;
use crate::session::{SessionLimits, UrbSession};
use protocol::{UrbFrame, UrbPrefix, read_exact_async, read_fixed_or_eof_async, write_frame_async};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Default time an unbound client may stay silent
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub limits: SessionLimits,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            limits: SessionLimits::default(),
        }
    }
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.server.handshake_timeout(),
            limits: SessionLimits::from(&config.session),
        }
    }
}

/// One client connection
pub struct Connection<S> {
    stream: S,
    peer: String,
    registry: Arc<DeviceRegistry>,
    settings: ConnectionSettings,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            stream,
            peer: peer.into(),
            registry,
            settings,
        }
    }

    /// Drive the connection until it closes
    ///
    /// Returns `Ok` when the peer closed the stream cleanly.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Connection {
            mut stream,
            peer,
            registry,
            settings,
        } = self;

        let outcome =
            handshake::negotiate(&mut stream, &registry, settings.handshake_timeout).await?;
        let HandshakeOutcome::Imported {
            device,
            backend,
            claim,
        } = outcome
        else {
            return Ok(());
        };

        info!("{} imported {}", peer, device.bus_id());

        let (reader, writer) = tokio::io::split(stream);
        let (reply_tx, reply_rx) = mpsc::channel(settings.limits.max_pending.max(1));
        let mut session = UrbSession::new(device.devid(), backend, reply_tx, settings.limits);
        let mut writer_task = tokio::spawn(write_loop(BufWriter::new(writer), reply_rx));
        let mut reader = BufReader::new(reader);

        let mut writer_done = false;
        let result = tokio::select! {
            result = read_loop(&mut reader, &mut session) => result,
            joined = &mut writer_task => {
                writer_done = true;
                match joined {
                    Ok(result) => result,
                    Err(e) => Err(std::io::Error::other(e).into()),
                }
            }
        };

        if let Err(e) = &result {
            debug!("Closing connection from {}: {}", peer, e);
        }

        let grace = settings.limits.teardown_grace;
        session.teardown().await;

        // The session dropped its reply sender; the writer drains what is left
        if !writer_done && tokio::time::timeout(grace, &mut writer_task).await.is_err() {
            debug!("Writer for {} did not finish, aborting", peer);
            writer_task.abort();
        }

        drop(claim);
        info!("{} released {}", peer, device.bus_id());

        match result {
            Err(e) if e.is_disconnect() => Ok(()),
            other => other,
        }
    }
}

/// Decode transfer frames and hand them to the session
///
/// Ends with `Ok` on a clean EOF between frames; a stream that stops inside a
/// frame is malformed.
async fn read_loop<R>(reader: &mut R, session: &mut UrbSession) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(prefix) = read_fixed_or_eof_async::<UrbPrefix, _>(reader).await? else {
            return Ok(());
        };

        let trailing = read_exact_async(reader, prefix.trailing_len()?).await?;
        let frame = prefix.into_frame(&trailing)?;
        trace!("Received {:?} seq={}", frame.header().command, frame.seqnum());

        session.handle_frame(frame).await?;
    }
}

/// Write reply frames in the order they arrive, flushing once the queue is empty
async fn write_loop<W>(
    mut writer: BufWriter<W>,
    mut replies: mpsc::Receiver<UrbFrame>,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = replies.recv().await {
        write_frame(&mut writer, &frame).await?;
        while let Ok(frame) = replies.try_recv() {
            write_frame(&mut writer, &frame).await?;
        }
        writer.flush().await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &UrbFrame) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    trace!("Sending {:?} seq={}", frame.header().command, frame.seqnum());
    write_frame_async(writer, &frame.encode()?).await?;
    Ok(())
}
