mod common;

use std::{fs, path::Path, sync::Arc};

use chrono::{Duration, Utc};
use dcpingest::{
    archive::ChannelSink,
    config::{NetDcpConfig, TargetConfig},
    message::{MsgType, SourceType},
    polling::NetDcpRecv,
    source::{InputSource, SourceKind},
    status::{StatusTable, TargetKey},
};

fn write_targets(path: &Path, targets: &[TargetConfig]) {
    fs::write(path, serde_json::to_string(targets).unwrap()).unwrap();
}

fn config(targets_file: &Path) -> NetDcpConfig {
    let mut cfg = NetDcpConfig::new(targets_file.to_path_buf());
    cfg.connect_timeout_secs = 2;
    cfg.idle_timeout_secs = 2;
    cfg.reconnect_delay_secs = 1;
    cfg
}

#[test]
fn test_polled_target_is_polled_and_recorded() {
    let now = Utc::now();
    let addr = common::serve(
        vec![[
            common::goes_message("CE7A5A32", &now, 'G', b"12.5"),
            // older than the age limit
            common::goes_message("CE7A5A32", &(now - Duration::days(3)), 'G', b"11.0"),
        ]
        .concat()],
        std::time::Duration::ZERO,
    );
    let dir = tempfile::tempdir().unwrap();
    let targets = dir.path().join("targets.json");
    write_targets(
        &targets,
        &[TargetConfig::new("127.0.0.1", addr.port(), "station-1", 60)],
    );

    let status = Arc::new(StatusTable::new());
    let (sink, rx) = ChannelSink::new();
    let netdcp = NetDcpRecv::new(config(&targets), Arc::clone(&status), Arc::new(sink));
    netdcp.start().unwrap();

    let msg = common::recv_msg(&rx);
    assert_eq!(msg.payload(), b"12.5");
    assert!(msg.header().starts_with("CE7A5A32"));
    assert_eq!(msg.failure_code(), 'G');
    assert_eq!(msg.flags().source, SourceType::NetDcp);
    assert_eq!(msg.flags().msg_type, MsgType::NetDcpPolled);
    assert_eq!(msg.source().unwrap().kind, SourceKind::Polled);

    let key = TargetKey::new("127.0.0.1", addr.port());
    assert!(common::wait_for(|| status
        .get(&key)
        .is_some_and(|s| s.good_polls == 1)));
    let recorded = status.get(&key).unwrap();
    assert_eq!(recorded.messages, 1);
    assert_eq!(recorded.failed_polls, 0);
    assert!(recorded.last_contact.is_some());
    assert!(rx.try_recv().is_err());

    let polled = netdcp.inputs()[0];
    assert!(polled.status().starts_with("polling 1 targets"), "{}", polled.status());

    netdcp.shutdown();
    assert_eq!(polled.status(), "disabled");
}

#[test]
fn test_unreachable_target_counts_failed_poll() {
    // nothing listens on a port that was just released
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let dir = tempfile::tempdir().unwrap();
    let targets = dir.path().join("targets.json");
    write_targets(&targets, &[TargetConfig::new("127.0.0.1", port, "gone", 60)]);

    let status = Arc::new(StatusTable::new());
    let (sink, rx) = ChannelSink::new();
    let netdcp = NetDcpRecv::new(config(&targets), Arc::clone(&status), Arc::new(sink));
    netdcp.start().unwrap();

    let key = TargetKey::new("127.0.0.1", port);
    assert!(common::wait_for(|| status
        .get(&key)
        .is_some_and(|s| s.failed_polls == 1)));
    let recorded = status.get(&key).unwrap();
    assert!(recorded.last_poll_attempt.is_some());
    assert!(recorded.last_contact.is_none());
    assert!(rx.try_recv().is_err());

    netdcp.shutdown();
}

#[test]
fn test_continuous_target_is_archived() {
    let now = Utc::now();
    let addr = common::serve(
        vec![common::goes_message("DD0010A4", &now, 'G', b"stage=1.25")],
        std::time::Duration::ZERO,
    );
    let dir = tempfile::tempdir().unwrap();
    let targets = dir.path().join("targets.json");
    write_targets(
        &targets,
        &[TargetConfig::new("127.0.0.1", addr.port(), "river", 0)],
    );

    let status = Arc::new(StatusTable::new());
    let (sink, rx) = ChannelSink::new();
    let netdcp = NetDcpRecv::new(config(&targets), Arc::clone(&status), Arc::new(sink));
    netdcp.start().unwrap();

    let msg = common::recv_msg(&rx);
    assert_eq!(msg.payload(), b"stage=1.25");
    assert_eq!(msg.flags().msg_type, MsgType::NetDcpContinuous);
    assert_eq!(msg.source().unwrap().kind, SourceKind::Continuous);
    assert_eq!(netdcp.scheduler().continuous_targets().len(), 1);

    let key = TargetKey::new("127.0.0.1", addr.port());
    assert!(common::wait_for(|| status
        .get(&key)
        .is_some_and(|s| s.last_contact.is_some() && s.messages == 1)));

    netdcp.shutdown();
}

#[test]
fn test_continuous_worker_follows_target_changes() {
    let now = Utc::now();
    let addr = common::serve_concurrent(
        vec![
            common::goes_message("DD0010A4", &now, 'G', b"first"),
            common::goes_message("DD0010A4", &now, 'G', b"second"),
        ],
        common::WAIT,
    );
    let dir = tempfile::tempdir().unwrap();
    let targets = dir.path().join("targets.json");
    write_targets(
        &targets,
        &[TargetConfig::new("127.0.0.1", addr.port(), "river", 0)],
    );

    let status = Arc::new(StatusTable::new());
    let (sink, rx) = ChannelSink::new();
    let netdcp = NetDcpRecv::new(config(&targets), Arc::clone(&status), Arc::new(sink));
    netdcp.start().unwrap();

    assert_eq!(common::recv_msg(&rx).payload(), b"first");
    assert_eq!(netdcp.continuous().workers(), 1);

    // a changed target gets a fresh worker and connection
    write_targets(
        &targets,
        &[TargetConfig::new("127.0.0.1", addr.port(), "river-upper", 0)],
    );
    let summary = netdcp.reload_now().unwrap();
    assert_eq!(summary.changed, 1);
    assert_eq!(common::recv_msg(&rx).payload(), b"second");
    assert_eq!(netdcp.continuous().workers(), 1);

    // a removed target's worker exits on its own
    write_targets(&targets, &[]);
    let summary = netdcp.reload_now().unwrap();
    assert_eq!(summary.removed, 1);
    assert!(netdcp.scheduler().continuous_targets().is_empty());
    assert!(common::wait_for(|| netdcp.continuous().workers() == 0));

    netdcp.shutdown();
}

#[test]
fn test_polled_pool_starts_at_minimum() {
    let dir = tempfile::tempdir().unwrap();
    let status = Arc::new(StatusTable::new());
    let (sink, _rx) = ChannelSink::new();
    // target list does not exist yet
    let netdcp = NetDcpRecv::new(
        config(&dir.path().join("targets.json")),
        status,
        Arc::new(sink),
    );
    netdcp.start().unwrap();

    assert!(netdcp.scheduler().is_empty());
    assert_eq!(netdcp.polled().workers(), 2);

    netdcp.shutdown();
    assert_eq!(netdcp.polled().workers(), 0);
}

#[test]
fn test_reload_applies_changes() {
    let dir = tempfile::tempdir().unwrap();
    let targets = dir.path().join("targets.json");
    write_targets(
        &targets,
        &[
            TargetConfig::new("dcp1.example.net", 5000, "one", 60),
            TargetConfig::new("dcp2.example.net", 5000, "two", 60),
        ],
    );

    let status = Arc::new(StatusTable::new());
    let (sink, _rx) = ChannelSink::new();
    let netdcp = NetDcpRecv::new(config(&targets), Arc::clone(&status), Arc::new(sink));

    let summary = netdcp.reload_now().unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(netdcp.scheduler().len(), 2);

    write_targets(
        &targets,
        &[
            TargetConfig::new("dcp1.example.net", 5000, "one", 30),
            TargetConfig::new("dcp3.example.net", 5000, "three", 0),
        ],
    );
    let summary = netdcp.reload_now().unwrap();
    assert_eq!(summary.changed, 1);
    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.unchanged, 0);
    assert_eq!(netdcp.scheduler().len(), 2);
    assert_eq!(netdcp.scheduler().continuous_targets().len(), 1);

    // a bad list leaves the live targets alone
    fs::write(&targets, "{}").unwrap();
    assert!(netdcp.reload_now().is_err());
    assert_eq!(netdcp.scheduler().len(), 2);

    // removed targets keep their status until pruned
    assert!(status.get(&TargetKey::new("dcp2.example.net", 5000)).is_some());
}
