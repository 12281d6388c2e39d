//! Integration tests for the USB/IP wire format
//!
//! Checks exact byte layouts against the Linux usbip tools, decoding of
//! frames split across reads, and the bounds the codec enforces.

use protocol::{
    BusId, Command, ControlHeader, DeviceSpeed, DeviceSummary, DeviceSummaryHeader, Direction,
    FixedFrame, InterfaceSummary, IsoPacketDescriptor, MessageHeader, OpCode, OpRepDevlist,
    OpRepImport, OpReqImport, ProtocolError, RetSubmitBody, RetSubmitFrame, RetUnlinkFrame,
    SubmitBody, SubmitFrame, UnlinkBody, UnlinkFrame, UrbFrame, UrbPrefix, UsbPath,
    USBIP_VERSION, read_exact_async, read_fixed_async,
};
use protocol::status::{ENOENT, ST_NODEV, ST_OK};

fn make_header(busid: &str, busnum: u32, devnum: u32) -> DeviceSummaryHeader {
    DeviceSummaryHeader {
        path: UsbPath::new(&format!("/sys/devices/pci0000:00/usb{}/{}", busnum, busid)).unwrap(),
        busid: BusId::new(busid).unwrap(),
        busnum,
        devnum,
        speed: DeviceSpeed::High as u32,
        id_vendor: 0x1d6b,
        id_product: 0x0104,
        bcd_device: 0x0100,
        b_device_class: 0xff,
        b_configuration_value: 1,
        b_num_configurations: 1,
        ..Default::default()
    }
}

fn vendor_interface() -> InterfaceSummary {
    InterfaceSummary {
        b_interface_class: 0xff,
        b_interface_subclass: 0,
        b_interface_protocol: 0,
    }
}

mod handshake {
    use super::*;

    #[test]
    fn test_req_devlist_bytes() {
        let bytes = ControlHeader::request(OpCode::ReqDevlist).encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x11, 0x80, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_devlist_single_device() {
        let reply = OpRepDevlist {
            devices: vec![DeviceSummary::new(
                make_header("1-1", 1, 2),
                vec![vendor_interface()],
            )],
        };
        let bytes = reply.encode().unwrap();

        assert_eq!(bytes.len(), 12 + 312 + 4);
        assert_eq!(&bytes[0..4], &[0x01, 0x11, 0x00, 0x05]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);

        // busid follows the 256-byte path
        let busid = &bytes[12 + 256..12 + 256 + 32];
        assert_eq!(&busid[..3], b"1-1");
        assert!(busid[3..].iter().all(|&b| b == 0));

        // bNumInterfaces is the last byte of the device header
        assert_eq!(bytes[12 + 311], 1);
        assert_eq!(&bytes[12 + 312..], &[0xff, 0, 0, 0]);

        let (header, decoded) = OpRepDevlist::decode(&bytes).unwrap();
        assert_eq!(header.status, ST_OK);
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_devlist_empty() {
        let bytes = OpRepDevlist::default().encode().unwrap();
        assert_eq!(bytes.len(), OpRepDevlist::PREFIX_SIZE);

        let (_, decoded) = OpRepDevlist::decode(&bytes).unwrap();
        assert!(decoded.devices.is_empty());
    }

    #[test]
    fn test_devlist_multiple_devices_with_interfaces() {
        let reply = OpRepDevlist {
            devices: vec![
                DeviceSummary::new(make_header("1-1", 1, 2), vec![vendor_interface()]),
                DeviceSummary::new(
                    make_header("1-2", 1, 3),
                    vec![vendor_interface(), vendor_interface()],
                ),
                DeviceSummary::new(make_header("2-1", 2, 2), Vec::new()),
            ],
        };
        let bytes = reply.encode().unwrap();
        assert_eq!(bytes.len(), 12 + 3 * 312 + 3 * 4);

        let (_, decoded) = OpRepDevlist::decode(&bytes).unwrap();
        assert_eq!(decoded.devices.len(), 3);
        assert_eq!(decoded.devices[1].interfaces.len(), 2);
        assert!(decoded.devices[2].header.busid.matches("2-1"));
    }

    #[test]
    fn test_import_request_bytes() {
        let request = OpReqImport {
            busid: BusId::new("3-1.4").unwrap(),
        };
        let bytes = request.encode_request().unwrap();

        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], &[0x01, 0x11, 0x80, 0x03]);
        assert_eq!(&bytes[8..13], b"3-1.4");
        assert!(bytes[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_import_reply_success_carries_header_only() {
        let reply = OpRepImport::success(make_header("1-1", 1, 2));
        let bytes = reply.encode().unwrap();
        assert_eq!(bytes.len(), 8 + 312);

        let (header, decoded) = OpRepImport::decode(&bytes).unwrap();
        assert_eq!(header.op_code().unwrap(), OpCode::RepImport);
        assert_eq!(decoded.device.unwrap().devid(), 0x0001_0002);
    }

    #[test]
    fn test_import_reply_failure_has_no_body() {
        let bytes = OpRepImport::failure(ST_NODEV).encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x11, 0x00, 0x03, 0, 0, 0, ST_NODEV as u8]);
    }

    #[test]
    fn test_full_width_busid_survives() {
        let busid = "9".repeat(32);
        let header = make_header(&busid, 1, 2);
        let bytes = OpRepImport::success(header).encode().unwrap();

        let (_, decoded) = OpRepImport::decode(&bytes).unwrap();
        assert_eq!(decoded.device.unwrap().busid.to_string_lossy(), busid);
    }

    #[test]
    fn test_header_version_is_preserved_on_decode() {
        let bytes = [0x01, 0x06, 0x80, 0x05, 0, 0, 0, 0];
        let header = ControlHeader::decode(&bytes).unwrap();
        assert_eq!(header.version, 0x0106);
        assert_ne!(header.version, USBIP_VERSION);
    }

    #[test]
    fn test_unknown_op_code() {
        let header = ControlHeader::decode(&[0x01, 0x11, 0x80, 0x42, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            header.op_code(),
            Err(ProtocolError::UnknownOpCode(0x8042))
        ));
    }
}

mod transfer {
    use super::*;

    fn submit_in(seqnum: u32, ep: u32, length: u32) -> SubmitFrame {
        SubmitFrame {
            header: MessageHeader::new(Command::Submit, seqnum, 0x0001_0002, Direction::In, ep),
            body: SubmitBody {
                transfer_buffer_length: length,
                ..Default::default()
            },
            payload: Vec::new(),
            iso_packets: Vec::new(),
        }
    }

    #[test]
    fn test_control_submit_setup_bytes() {
        let mut frame = submit_in(1, 0, 18);
        frame.body.setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let bytes = UrbFrame::Submit(frame).encode().unwrap();

        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[40..48], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    }

    #[test]
    fn test_ret_submit_in_with_data() {
        let submit = submit_in(7, 1, 64);
        let ret = RetSubmitFrame::reply_to(
            &submit.header,
            RetSubmitBody {
                actual_length: 40,
                ..Default::default()
            },
            vec![0x11; 40],
        );
        let bytes = UrbFrame::RetSubmit(ret).encode().unwrap();

        assert_eq!(bytes.len(), 48 + 40);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 3]);
        assert_eq!(&bytes[4..8], &7u32.to_be_bytes());
        assert_eq!(&bytes[20..24], &0i32.to_be_bytes());
        assert_eq!(&bytes[24..28], &40u32.to_be_bytes());
        assert!(bytes[48..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_ret_submit_out_has_no_payload() {
        let submit = MessageHeader::new(Command::Submit, 3, 0x0001_0002, Direction::Out, 2);
        let ret = RetSubmitFrame::reply_to(
            &submit,
            RetSubmitBody {
                actual_length: 512,
                ..Default::default()
            },
            Vec::new(),
        );
        let bytes = UrbFrame::RetSubmit(ret).encode().unwrap();
        assert_eq!(bytes.len(), 48);

        let (decoded, used) = UrbFrame::decode(&bytes).unwrap();
        assert_eq!(used, 48);
        let UrbFrame::RetSubmit(decoded) = decoded else {
            panic!("Expected RetSubmit");
        };
        assert_eq!(decoded.body.actual_length, 512);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_zero_length_out_submit() {
        let frame = UrbFrame::Submit(SubmitFrame {
            header: MessageHeader::new(Command::Submit, 4, 0x0001_0002, Direction::Out, 2),
            body: SubmitBody::default(),
            payload: Vec::new(),
            iso_packets: Vec::new(),
        });
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), 48);

        let (decoded, _) = UrbFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unlink_roundtrip() {
        let frame = UrbFrame::Unlink(UnlinkFrame {
            header: MessageHeader::new(Command::Unlink, 10, 0x0001_0002, Direction::Out, 0),
            body: UnlinkBody { unlink_seqnum: 9 },
        });
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[20..24], &9u32.to_be_bytes());

        let (decoded, _) = UrbFrame::decode(&bytes).unwrap();
        assert_eq!(decoded.seqnum(), 10);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_ret_unlink_not_found() {
        let unlink = MessageHeader::new(Command::Unlink, 12, 0x0001_0002, Direction::Out, 0);
        let bytes = UrbFrame::RetUnlink(RetUnlinkFrame::reply_to(&unlink, ENOENT))
            .encode()
            .unwrap();

        assert_eq!(&bytes[0..4], &[0, 0, 0, 4]);
        assert_eq!(&bytes[20..24], &ENOENT.to_be_bytes());
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_iso_ret_submit_descriptors_follow_payload() {
        let submit = MessageHeader::new(Command::Submit, 20, 0x0001_0002, Direction::In, 3);
        let mut ret = RetSubmitFrame::reply_to(
            &submit,
            RetSubmitBody {
                actual_length: 6,
                number_of_packets: 2,
                ..Default::default()
            },
            vec![1, 2, 3, 4, 5, 6],
        );
        ret.iso_packets = vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 4,
                actual_length: 3,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 4,
                length: 4,
                actual_length: 3,
                status: 0,
            },
        ];
        let bytes = UrbFrame::RetSubmit(ret.clone()).encode().unwrap();
        assert_eq!(bytes.len(), 48 + 6 + 32);
        assert_eq!(&bytes[48..54], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[54 + 4..54 + 8], &4u32.to_be_bytes());

        let (decoded, _) = UrbFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, UrbFrame::RetSubmit(ret));
    }

    #[test]
    fn test_too_many_iso_packets_rejected() {
        let mut frame = submit_in(1, 3, 0);
        frame.body.number_of_packets = 4096;
        let bytes = frame.header.encode().unwrap();
        let mut block = bytes;
        block.extend(frame.body.encode().unwrap());

        let prefix = UrbPrefix::decode(&block).unwrap();
        assert!(matches!(
            prefix.trailing_len(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_short_prefix_is_malformed() {
        let bytes = UrbFrame::Submit(submit_in(1, 1, 8)).encode().unwrap();
        let Err(ProtocolError::MalformedFrame { needed, available }) =
            UrbPrefix::decode(&bytes[..30])
        else {
            panic!("Expected MalformedFrame");
        };
        assert_eq!(needed, 48);
        assert_eq!(available, 30);
    }
}

mod async_io {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_prefix_then_payload_across_writes() {
        let frame = UrbFrame::Submit(SubmitFrame {
            header: MessageHeader::new(Command::Submit, 5, 0x0001_0002, Direction::Out, 1),
            body: SubmitBody {
                transfer_buffer_length: 100,
                ..Default::default()
            },
            payload: (0..100).collect(),
            iso_packets: Vec::new(),
        });
        let bytes = frame.encode().unwrap();

        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let prefix: UrbPrefix = read_fixed_async(&mut server).await.unwrap();
        let trailing = read_exact_async(&mut server, prefix.trailing_len().unwrap())
            .await
            .unwrap();
        let decoded = prefix.into_frame(&trailing).unwrap();

        writer.await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_eof_between_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_fixed_async::<ControlHeader, _>(&mut server)
            .await
            .unwrap_err();
        assert!(err.is_eof());
    }
}
