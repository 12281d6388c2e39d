//! Connection integration tests
//!
//! Drives a full [`Connection`] over an in-memory duplex stream against a
//! registry holding the default loopback device (bus id `1-1`, bus 1,
//! device 2), covering:
//! - Device listing and import, including failed imports and retries
//! - Exclusive import policy
//! - SUBMIT/UNLINK exchanges and their replies
//! - Protocol violations that close the connection
//!
//! Run with: `cargo test -p server --test connection_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use protocol::status::{ENODEV, ENOENT, ST_DEV_BUSY, ST_NODEV, ST_OK, URB_OK};
use protocol::{
    BusId, Command, ControlHeader, DeviceSummaryHeader, Direction, FixedFrame, MessageHeader,
    OpCode, OpRepDevlist, OpReqImport, ProtocolError, SubmitBody, SubmitFrame, UnlinkBody,
    UnlinkFrame, UrbFrame, UrbPrefix, read_exact_async, read_fixed_async,
};
use server::{
    Connection, ConnectionError, ConnectionSettings, DeviceRegistry, ImportPolicy, ServerConfig,
    Violation,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::task::JoinHandle;

const DEVID: u32 = 0x0001_0002;

// ============================================================================
// Helpers
// ============================================================================

fn registry(policy: ImportPolicy) -> Arc<DeviceRegistry> {
    let mut config = ServerConfig::default();
    config.export.import_policy = policy;
    Arc::new(DeviceRegistry::from_config(&config).unwrap())
}

fn connect(
    registry: &Arc<DeviceRegistry>,
    settings: ConnectionSettings,
) -> (DuplexStream, JoinHandle<Result<(), ConnectionError>>) {
    let (server, client) = duplex(64 * 1024);
    let connection = Connection::new(server, "test-peer", Arc::clone(registry), settings);
    (client, tokio::spawn(connection.run()))
}

/// Send OP_REQ_IMPORT and return the reply status and device, if any
async fn import(client: &mut DuplexStream, bus_id: &str) -> (u32, Option<DeviceSummaryHeader>) {
    let request = OpReqImport {
        busid: BusId::new(bus_id).unwrap(),
    };
    client
        .write_all(&request.encode_request().unwrap())
        .await
        .unwrap();

    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        let header: ControlHeader = read_fixed_async(client).await.unwrap();
        assert_eq!(header.op_code().unwrap(), OpCode::RepImport);
        if header.status != ST_OK {
            return (header.status, None);
        }
        let device: DeviceSummaryHeader = read_fixed_async(client).await.unwrap();
        (header.status, Some(device))
    })
    .await
    .unwrap()
}

async fn send(client: &mut DuplexStream, frame: UrbFrame) {
    client.write_all(&frame.encode().unwrap()).await.unwrap();
}

async fn recv(client: &mut DuplexStream) -> UrbFrame {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        let prefix: UrbPrefix = read_fixed_async(client).await.unwrap();
        let trailing = read_exact_async(client, prefix.trailing_len().unwrap())
            .await
            .unwrap();
        prefix.into_frame(&trailing).unwrap()
    })
    .await
    .unwrap()
}

/// Read until the server closes the stream
async fn expect_closed(client: &mut DuplexStream) {
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        let mut buf = [0u8; 256];
        while client.read(&mut buf).await.unwrap_or(0) > 0 {}
    })
    .await
    .unwrap();
}

fn submit(seqnum: u32, devid: u32, direction: Direction, ep: u32, length: u32) -> SubmitFrame {
    SubmitFrame {
        header: MessageHeader::new(Command::Submit, seqnum, devid, direction, ep),
        body: SubmitBody {
            transfer_buffer_length: length,
            ..Default::default()
        },
        payload: Vec::new(),
        iso_packets: Vec::new(),
    }
}

fn bulk_in(seqnum: u32, length: u32) -> UrbFrame {
    UrbFrame::Submit(submit(seqnum, DEVID, Direction::In, 1, length))
}

fn bulk_out(seqnum: u32, data: Vec<u8>) -> UrbFrame {
    let mut frame = submit(seqnum, DEVID, Direction::Out, 1, data.len() as u32);
    frame.payload = data;
    UrbFrame::Submit(frame)
}

fn unlink(seqnum: u32, target: u32) -> UrbFrame {
    UrbFrame::Unlink(UnlinkFrame {
        header: MessageHeader::new(Command::Unlink, seqnum, DEVID, Direction::Out, 0),
        body: UnlinkBody {
            unlink_seqnum: target,
        },
    })
}

async fn imported(
    registry: &Arc<DeviceRegistry>,
) -> (DuplexStream, JoinHandle<Result<(), ConnectionError>>) {
    let (mut client, task) = connect(registry, ConnectionSettings::default());
    let (status, _) = import(&mut client, "1-1").await;
    assert_eq!(status, ST_OK);
    (client, task)
}

// ============================================================================
// Handshake
// ============================================================================

mod handshake {
    use super::*;

    #[tokio::test]
    async fn test_devlist_reports_loopback_device() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, task) = connect(&registry, ConnectionSettings::default());

        client
            .write_all(&ControlHeader::request(OpCode::ReqDevlist).encode().unwrap())
            .await
            .unwrap();

        let mut reply = vec![0u8; OpRepDevlist::PREFIX_SIZE + 312 + 4];
        with_timeout(DEFAULT_TEST_TIMEOUT, client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();

        // OP_REP_DEVLIST, version 0x0111, status 0, one device
        assert_eq!(&reply[..12], &[0x01, 0x11, 0x00, 0x05, 0, 0, 0, 0, 0, 0, 0, 1]);
        // Bus id is NUL padded to 32 bytes after the 256-byte path
        assert_eq!(&reply[12 + 256..12 + 256 + 4], b"1-1\0");
        assert!(reply[12 + 256 + 3..12 + 256 + 32].iter().all(|&b| b == 0));

        let (_, list) = OpRepDevlist::decode(&reply).unwrap();
        assert_eq!(list.devices[0].header.devid(), DEVID);

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_import_unknown_then_retry() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, _task) = connect(&registry, ConnectionSettings::default());

        let (status, device) = import(&mut client, "9-9").await;
        assert_eq!(status, ST_NODEV);
        assert!(device.is_none());

        let (status, device) = import(&mut client, "1-1").await;
        assert_eq!(status, ST_OK);
        let device = device.unwrap();
        assert!(device.busid.matches("1-1"));
        assert_eq!(device.devid(), DEVID);
    }

    #[tokio::test]
    async fn test_shared_import_twice() {
        let registry = registry(ImportPolicy::Shared);
        let (_first, _first_task) = imported(&registry).await;
        let (_second, _second_task) = imported(&registry).await;
    }

    #[tokio::test]
    async fn test_exclusive_import_busy_until_released() {
        let registry = registry(ImportPolicy::Exclusive);
        let (first, first_task) = imported(&registry).await;

        let (mut second, _second_task) = connect(&registry, ConnectionSettings::default());
        let (status, _) = import(&mut second, "1-1").await;
        assert_eq!(status, ST_DEV_BUSY);

        drop(first);
        with_timeout(DEFAULT_TEST_TIMEOUT, first_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!registry.is_claimed("1-1"));

        let (status, _) = import(&mut second, "1-1").await;
        assert_eq!(status, ST_OK);
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let registry = registry(ImportPolicy::Shared);
        let settings = ConnectionSettings {
            handshake_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (_client, task) = connect(&registry, settings);

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_transfer_before_import_closes() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, task) = connect(&registry, ConnectionSettings::default());

        send(&mut client, bulk_in(1, 64)).await;
        expect_closed(&mut client).await;

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Violation(Violation::TransferBeforeImport(1)))
        ));
    }
}

// ============================================================================
// Transfer phase
// ============================================================================

mod transfers {
    use super::*;

    #[tokio::test]
    async fn test_out_then_in_returns_written_data() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, _task) = imported(&registry).await;

        let data: Vec<u8> = (0..40).collect();
        send(&mut client, bulk_out(6, data.clone())).await;
        let UrbFrame::RetSubmit(ret) = recv(&mut client).await else {
            panic!("expected RET_SUBMIT");
        };
        assert_eq!(ret.header.seqnum, 6);
        assert_eq!(ret.body.status, URB_OK);
        assert_eq!(ret.body.actual_length, 40);
        assert!(ret.payload.is_empty());

        send(&mut client, bulk_in(7, 64)).await;
        let UrbFrame::RetSubmit(ret) = recv(&mut client).await else {
            panic!("expected RET_SUBMIT");
        };
        assert_eq!(ret.header.seqnum, 7);
        assert_eq!(ret.body.status, URB_OK);
        assert_eq!(ret.body.actual_length, 40);
        assert_eq!(ret.payload, data);
    }

    #[tokio::test]
    async fn test_get_device_descriptor() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, _task) = imported(&registry).await;

        let mut frame = submit(1, DEVID, Direction::In, 0, 18);
        frame.body.setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        send(&mut client, UrbFrame::Submit(frame)).await;

        let UrbFrame::RetSubmit(ret) = recv(&mut client).await else {
            panic!("expected RET_SUBMIT");
        };
        assert_eq!(ret.body.status, URB_OK);
        assert_eq!(ret.body.actual_length, 18);
        assert_eq!(ret.payload[0], 18);
        assert_eq!(ret.payload[1], 0x01);
        // idVendor 0x1d6b, idProduct 0x0104
        assert_eq!(&ret.payload[8..12], &[0x6b, 0x1d, 0x04, 0x01]);
    }

    #[tokio::test]
    async fn test_unlink_pending_read() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, _task) = imported(&registry).await;

        send(&mut client, bulk_in(9, 64)).await;
        send(&mut client, unlink(10, 9)).await;

        let UrbFrame::RetUnlink(ret) = recv(&mut client).await else {
            panic!("expected RET_UNLINK");
        };
        assert_eq!(ret.header.seqnum, 10);
        assert_eq!(ret.body.status, 0);

        // No RET_SUBMIT for 9 follows; the next reply answers the next request
        send(&mut client, unlink(11, 9)).await;
        let UrbFrame::RetUnlink(ret) = recv(&mut client).await else {
            panic!("expected RET_UNLINK");
        };
        assert_eq!(ret.header.seqnum, 11);
        assert_eq!(ret.body.status, ENOENT);
    }

    #[tokio::test]
    async fn test_unlink_unknown_seqnum() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, _task) = imported(&registry).await;

        send(&mut client, unlink(20, 99)).await;
        let UrbFrame::RetUnlink(ret) = recv(&mut client).await else {
            panic!("expected RET_UNLINK");
        };
        assert_eq!(ret.header.seqnum, 20);
        assert_eq!(ret.body.status, ENOENT);

        // The connection stays usable
        send(&mut client, bulk_out(21, vec![1, 2, 3])).await;
        assert_eq!(recv(&mut client).await.seqnum(), 21);
    }

    #[tokio::test]
    async fn test_wrong_devid_answered_with_enodev() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, _task) = imported(&registry).await;

        send(
            &mut client,
            UrbFrame::Submit(submit(3, 0x0005_0005, Direction::In, 1, 8)),
        )
        .await;
        let UrbFrame::RetSubmit(ret) = recv(&mut client).await else {
            panic!("expected RET_SUBMIT");
        };
        assert_eq!(ret.header.seqnum, 3);
        assert_eq!(ret.body.status, ENODEV);
        assert!(ret.payload.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_seqnum_closes() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, task) = imported(&registry).await;

        // Two reads the loopback device cannot answer yet, then a duplicate
        send(&mut client, bulk_in(8, 64)).await;
        send(&mut client, bulk_in(9, 64)).await;
        send(&mut client, bulk_in(9, 16)).await;

        // Teardown cancels 8 and 9 without answering either of them
        let mut rest = Vec::new();
        with_timeout(DEFAULT_TEST_TIMEOUT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Violation(Violation::DuplicateSeqnum(9)))
        ));
    }

    #[tokio::test]
    async fn test_stream_ending_inside_frame_is_malformed() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, task) = imported(&registry).await;

        let bytes = bulk_in(1, 64).encode().unwrap();
        client.write_all(&bytes[..20]).await.unwrap();
        client.shutdown().await.unwrap();

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(ConnectionError::Malformed(ProtocolError::MalformedFrame {
                needed: 48,
                available: 20
            }))
        ));
    }

    #[tokio::test]
    async fn test_handshake_frame_after_import_closes() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, task) = imported(&registry).await;

        // 8 + 40 bytes: read as a 48-byte transfer header with a bogus command
        let mut bytes = ControlHeader::request(OpCode::ReqDevlist).encode().unwrap();
        let request = OpReqImport {
            busid: BusId::new("1-1").unwrap(),
        };
        bytes.extend(request.encode_request().unwrap());
        client.write_all(&bytes).await.unwrap();
        expect_closed(&mut client).await;

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_client_close_is_clean() {
        let registry = registry(ImportPolicy::Shared);
        let (mut client, task) = imported(&registry).await;

        // Leave a read pending so teardown has something to cancel
        send(&mut client, bulk_in(1, 64)).await;
        drop(client);

        let result = with_timeout(DEFAULT_TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
