//! Handshake phase: device listing and import
//!
//! An unbound connection may ask for the device list any number of times.
//! A successful import binds the connection to one device for good; a
//! failed import leaves it unbound so the client can try again.

use crate::backend::DeviceBackend;
use crate::error::{ConnectionError, Violation};
use crate::registry::{DeviceRegistry, ExportedDevice, ImportClaim};
use protocol::status::{ST_DEV_BUSY, ST_DEV_ERR, ST_NODEV};
use protocol::{
    ControlHeader, OpCode, OpRepDevlist, OpRepImport, OpReqImport, ProtocolVersion,
    read_fixed_async, read_fixed_or_eof_async, write_frame_async,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// How a handshake ended
pub enum HandshakeOutcome {
    /// The client imported a device; the connection moves to the transfer phase
    Imported {
        device: Arc<ExportedDevice>,
        backend: Arc<dyn DeviceBackend>,
        claim: ImportClaim,
    },
    /// The client went away before importing anything
    Closed,
}

/// Serve handshake requests until an import succeeds or the peer leaves
///
/// Each read must complete within `timeout`.
pub async fn negotiate<S>(
    stream: &mut S,
    registry: &DeviceRegistry,
    timeout: Duration,
) -> Result<HandshakeOutcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let header: ControlHeader =
            match with_deadline(timeout, read_fixed_or_eof_async(stream)).await?? {
                Some(header) => header,
                None => {
                    debug!("Peer closed during handshake");
                    return Ok(HandshakeOutcome::Closed);
                }
            };

        check_version(&header)?;

        match header.op_code() {
            Ok(OpCode::ReqDevlist) => {
                let devices = registry.list();
                debug!("OP_REQ_DEVLIST, replying with {} device(s)", devices.len());
                let reply = OpRepDevlist { devices }.encode()?;
                send(stream, &reply).await?;
            }
            Ok(OpCode::ReqImport) => {
                let request: OpReqImport = with_deadline(timeout, read_fixed_async(stream)).await??;
                let bus_id = request.busid.to_string_lossy().into_owned();
                debug!("OP_REQ_IMPORT for {}", bus_id);

                if let Some(outcome) = import(stream, registry, &bus_id).await? {
                    return Ok(outcome);
                }
            }
            _ => return Err(Violation::UnexpectedOpCode(header.code).into()),
        }
    }
}

/// Reject headers that do not carry our protocol version
///
/// A transfer frame sent before import reads as version 0 with its command
/// in the op code position.
fn check_version(header: &ControlHeader) -> Result<(), Violation> {
    if ProtocolVersion(header.version).is_supported() {
        return Ok(());
    }
    if header.version == 0 && (1..=4).contains(&header.code) {
        return Err(Violation::TransferBeforeImport(header.code));
    }
    Err(Violation::VersionMismatch(header.version))
}

/// Answer one import request
///
/// Returns `None` when the import failed and the handshake continues.
async fn import<S>(
    stream: &mut S,
    registry: &DeviceRegistry,
    bus_id: &str,
) -> Result<Option<HandshakeOutcome>, ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    let Some(device) = registry.describe(bus_id) else {
        info!("Import of unknown device {} refused", bus_id);
        send(stream, &OpRepImport::failure(ST_NODEV).encode()?).await?;
        return Ok(None);
    };

    let Some(claim) = registry.claim(bus_id) else {
        info!("Import of {} refused, device is in use", bus_id);
        send(stream, &OpRepImport::failure(ST_DEV_BUSY).encode()?).await?;
        return Ok(None);
    };

    let backend = match device.backend().open().await {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Failed to open device {}: {}", bus_id, e);
            drop(claim);
            send(stream, &OpRepImport::failure(ST_DEV_ERR).encode()?).await?;
            return Ok(None);
        }
    };

    send(stream, &OpRepImport::success(device.summary.header).encode()?).await?;
    info!("Imported device {} (devid {:#010x})", bus_id, device.devid());

    Ok(Some(HandshakeOutcome::Imported {
        device,
        backend,
        claim,
    }))
}

async fn send<S>(stream: &mut S, bytes: &[u8]) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    write_frame_async(stream, bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn with_deadline<F: Future>(
    timeout: Duration,
    future: F,
) -> Result<F::Output, ConnectionError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LoopbackFactory, loopback::LoopbackProfile};
    use crate::config::ImportPolicy;
    use common::test_utils::create_mock_summary;
    use protocol::{DeviceSpeed, FixedFrame, status::ST_OK};
    use tokio::io::{AsyncReadExt, duplex};

    fn registry() -> DeviceRegistry {
        DeviceRegistry::with_devices(
            ImportPolicy::Shared,
            vec![ExportedDevice::new(
                create_mock_summary("1-1", 1, 2),
                Arc::new(LoopbackFactory::new(LoopbackProfile {
                    speed: DeviceSpeed::High,
                    vendor_id: 0x1234,
                    product_id: 0x5678,
                })),
            )],
        )
    }

    #[test]
    fn test_check_version() {
        let ok = ControlHeader::request(OpCode::ReqDevlist);
        assert!(check_version(&ok).is_ok());

        let transfer = ControlHeader {
            version: 0,
            code: 1,
            status: 0,
        };
        assert_eq!(
            check_version(&transfer),
            Err(Violation::TransferBeforeImport(1))
        );

        let old = ControlHeader {
            version: 0x0106,
            ..ok
        };
        assert_eq!(check_version(&old), Err(Violation::VersionMismatch(0x0106)));
    }

    #[tokio::test]
    async fn test_devlist_then_close() {
        let registry = registry();
        let (mut server, mut client) = duplex(4096);

        let task = tokio::spawn(async move {
            negotiate(&mut server, &registry, Duration::from_secs(5)).await
        });

        client
            .write_all(&ControlHeader::request(OpCode::ReqDevlist).encode().unwrap())
            .await
            .unwrap();
        let mut reply = vec![0u8; OpRepDevlist::PREFIX_SIZE + 312 + 4];
        client.read_exact(&mut reply).await.unwrap();
        let (header, list) = OpRepDevlist::decode(&reply).unwrap();
        assert_eq!(header.status, ST_OK);
        assert_eq!(list.devices.len(), 1);

        drop(client);
        assert!(matches!(task.await.unwrap(), Ok(HandshakeOutcome::Closed)));
    }

    #[tokio::test]
    async fn test_import_binds() {
        let registry = registry();
        let (mut server, mut client) = duplex(4096);

        let task = tokio::spawn(async move {
            negotiate(&mut server, &registry, Duration::from_secs(5)).await
        });

        let request = OpReqImport {
            busid: protocol::BusId::new("1-1").unwrap(),
        };
        client.write_all(&request.encode_request().unwrap()).await.unwrap();

        let mut reply = vec![0u8; 8 + 312];
        client.read_exact(&mut reply).await.unwrap();
        let (header, rep) = OpRepImport::decode(&reply).unwrap();
        assert_eq!(header.status, ST_OK);
        assert_eq!(rep.device.unwrap().devid(), 0x0001_0002);

        match task.await.unwrap() {
            Ok(HandshakeOutcome::Imported { device, .. }) => {
                assert_eq!(device.bus_id(), "1-1");
            }
            _ => panic!("expected import"),
        }
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let registry = registry();
        let (mut server, _client) = duplex(64);

        let result = negotiate(&mut server, &registry, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConnectionError::HandshakeTimeout)));
    }
}
