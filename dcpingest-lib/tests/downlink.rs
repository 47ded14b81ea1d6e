mod common;

use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use dcpingest::{
    archive::ChannelSink,
    config::{DownlinkBackend, DownlinkConfig},
    downlink::{DeviceTransport, DownlinkRecv, LinkStatus, TcpRelayTransport},
    message::{MsgType, SourceType},
    source::{InputSource, SourceKind},
    Error,
};

#[test]
fn test_relay_messages_are_archived() {
    let xmit = Utc.with_ymd_and_hms(2024, 10, 18, 15, 30, 12).unwrap();
    let mut stream = vec![0x00, 0x07, 0xaa];
    stream.extend(common::downlink_frame(
        41,
        &common::goes_message("CE7A5A32", &xmit, 'G', b"12.5,0.3"),
    ));
    // abnormal received message report, not archived
    stream.extend(common::downlink_frame(
        42,
        &common::goes_message("CE7A5A32", &xmit, 'U', b""),
    ));
    stream.extend(common::downlink_frame(
        45,
        &common::goes_message("DD0010A4", &xmit, '?', b"77"),
    ));
    let addr = common::serve(vec![stream], common::WAIT);

    let cfg = DownlinkConfig::new(DownlinkBackend::Tcp {
        host: addr.ip().to_string(),
        port: addr.port(),
    });
    let transport = TcpRelayTransport::new(&addr.ip().to_string(), addr.port(), cfg.buffer_capacity);
    let (sink, rx) = ChannelSink::new();
    let downlink = DownlinkRecv::new(cfg, transport, Arc::new(sink));
    downlink.enable(true).unwrap();

    let first = common::recv_msg(&rx);
    assert_eq!(first.header(), "CE7A5A3224292153012G44+0NN117EXE00008");
    assert_eq!(first.payload(), b"12.5,0.3");
    assert_eq!(first.seq_num(), Some(41));
    assert_eq!(first.xmit_time(), Some(xmit));
    assert_eq!(first.flags().source, SourceType::Downlink);
    assert_eq!(first.flags().msg_type, MsgType::Goes);
    assert_eq!(first.source().unwrap().kind, SourceKind::Downlink);

    let second = common::recv_msg(&rx);
    assert_eq!(second.seq_num(), Some(45));
    assert_eq!(second.failure_code(), '?');

    let stats = downlink.stats();
    assert_eq!(stats.frames, 3);
    assert_eq!(stats.skipped_bytes, 3);
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.dropped_arms, 1);
    assert_eq!(stats.seq_gaps, 1);
    assert_eq!(downlink.link_status(), LinkStatus::Active);
    assert!(downlink.status().starts_with("Active: 3 frames, 2 messages"));

    downlink.shutdown();
    assert_eq!(downlink.link_status(), LinkStatus::Shutdown);
    assert!(matches!(downlink.enable(true), Err(Error::Shutdown)));
}

#[test]
fn test_device_messages_are_archived() {
    let xmit = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&common::downlink_frame(
        7,
        &common::goes_message("CE7A5A32", &xmit, 'G', b"abc"),
    ))
    .unwrap();
    file.flush().unwrap();

    let path = file.path().to_path_buf();
    let cfg = DownlinkConfig::new(DownlinkBackend::Device { path: path.clone() });
    let transport = DeviceTransport::new(path, cfg.buffer_capacity);
    let (sink, rx) = ChannelSink::new();
    let downlink = DownlinkRecv::new(cfg, transport, Arc::new(sink));
    downlink.enable(true).unwrap();

    let msg = common::recv_msg(&rx);
    assert_eq!(msg.payload(), b"abc");
    assert_eq!(msg.seq_num(), Some(7));

    // nothing more to read is not an error
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(downlink.link_status(), LinkStatus::Active);

    downlink.enable(false).unwrap();
    assert_eq!(downlink.link_status(), LinkStatus::Disabled);
    downlink.shutdown();
}

#[test]
fn test_missing_device_is_not_retried() {
    let path = PathBuf::from("/nonexistent/dcp-downlink0");
    let cfg = DownlinkConfig::new(DownlinkBackend::Device { path: path.clone() });
    let transport = DeviceTransport::new(path, cfg.buffer_capacity);
    let (sink, _rx) = ChannelSink::new();
    let downlink = DownlinkRecv::new(cfg, transport, Arc::new(sink));

    assert!(matches!(downlink.enable(true), Err(Error::TransportInit(_))));
    assert_eq!(downlink.link_status(), LinkStatus::HwError);
    assert!(downlink.status().contains("does not exist"), "{}", downlink.status());

    assert!(downlink.enable(true).is_err());
    assert_eq!(downlink.link_status(), LinkStatus::HwError);
}
