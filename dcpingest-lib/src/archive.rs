//! Hand-off of canonical messages to the central archive.
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{trace, warn};

use crate::message::DcpMsg;
use crate::source::SourceId;

/// Receives every message that leaves an input.
///
/// Implementations must be safe for concurrent callers and must not block on
/// durability. Failures are logged by the sink, never surfaced to the transport.
pub trait ArchiveSink: Send + Sync {
    fn archive(&self, msg: DcpMsg, source: &SourceId);
}

/// [ArchiveSink] that forwards messages over a channel to a single consumer.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<DcpMsg>,
}

impl ChannelSink {
    /// Create a sink and the receiver its messages are delivered on.
    #[must_use]
    pub fn new() -> (Self, Receiver<DcpMsg>) {
        let (tx, rx) = unbounded();
        (ChannelSink { tx }, rx)
    }
}

impl ArchiveSink for ChannelSink {
    fn archive(&self, msg: DcpMsg, source: &SourceId) {
        trace!(%source, "{msg}");
        if let Err(err) = self.tx.send(msg) {
            warn!(%source, "archive consumer gone, dropping {}", err.0);
        }
    }
}

/// Per-input archive handle: stamps the input's [SourceId], hands out the
/// input's sequence numbers and counts what was archived.
pub struct Archiver {
    source: SourceId,
    sink: Arc<dyn ArchiveSink>,
    next_seq: AtomicU32,
    archived: AtomicU64,
}

impl Archiver {
    pub fn new(source: SourceId, sink: Arc<dyn ArchiveSink>) -> Self {
        Archiver {
            source,
            sink,
            next_seq: AtomicU32::new(0),
            archived: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Next sequence number for a message from this input.
    pub fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn archive(&self, msg: DcpMsg) {
        self.archived.fetch_add(1, Ordering::Relaxed);
        self.sink.archive(msg.stamped(&self.source), &self.source);
    }

    /// Number of messages archived so far.
    #[must_use]
    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgFlags, MsgType, SourceType};
    use crate::source::SourceKind;

    #[test]
    fn archiver_stamps_and_counts() {
        let (sink, rx) = ChannelSink::new();
        let archiver = Archiver::new(SourceId::new(SourceKind::Sbd, "iridium"), Arc::new(sink));

        let seq = archiver.next_seq();
        let msg = DcpMsg::builder()
            .header(String::new())
            .payload(b"x".to_vec())
            .flags(MsgFlags::new(SourceType::Iridium, MsgType::Iridium))
            .seq_num(seq)
            .build();
        archiver.archive(msg);

        let got = rx.try_recv().unwrap();
        assert_eq!(got.source().unwrap().kind, SourceKind::Sbd);
        assert_eq!(got.seq_num(), Some(0));
        assert_eq!(archiver.archived(), 1);
        assert_eq!(archiver.next_seq(), 1);
    }

    #[test]
    fn send_to_dropped_consumer_does_not_panic() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let msg = DcpMsg::builder()
            .header(String::new())
            .payload(Vec::new())
            .flags(MsgFlags::new(SourceType::NetDcp, MsgType::NetDcpPolled))
            .build();
        sink.archive(msg, &SourceId::new(SourceKind::Polled, "netdcp"));
    }
}
