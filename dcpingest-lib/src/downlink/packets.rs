use std::time::Instant;

use tracing::{debug, trace};

/// Packet header: HDLC header, flags, message sequence, packet sequence.
pub const PACKET_HEADER_LEN: usize = 8;
/// Flag bit set on every packet of a message except the last.
const MORE_PACKETS: u8 = 0x10;

/// A message reassembled from one or more downlink packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub seq: u16,
    pub data: Vec<u8>,
}

/// Packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub more: bool,
    pub msg_seq: u16,
    pub pkt_seq: u8,
}

impl PacketHeader {
    #[must_use]
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < PACKET_HEADER_LEN {
            return None;
        }
        Some(PacketHeader {
            more: frame[4] & MORE_PACKETS != 0,
            msg_seq: u16::from_be_bytes([frame[5], frame[6]]),
            pkt_seq: frame[7] & 0x7f,
        })
    }
}

/// Joins the packets of each message. A message starts with packet 1; each
/// following packet must carry the same message sequence and the next packet
/// sequence, otherwise the partial message is dropped.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    current: Option<(u16, u8)>,
    buf: Vec<u8>,
    /// Partial messages dropped due to missing or out of order packets.
    pub dropped: u64,
}

impl MessageAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_partial(&mut self) {
        if self.current.take().is_some() {
            self.dropped += 1;
        }
        self.buf.clear();
    }

    /// Add a frame, returning the message it completed, if any.
    pub fn push(&mut self, frame: &[u8]) -> Option<Assembled> {
        let Some(hdr) = PacketHeader::decode(frame) else {
            trace!(len = frame.len(), "ignoring short frame");
            return None;
        };

        let continues = matches!(
            self.current,
            Some((seq, last)) if seq == hdr.msg_seq && hdr.pkt_seq == last.wrapping_add(1)
        );
        if hdr.pkt_seq == 1 {
            if self.current.is_some() {
                debug!(seq = hdr.msg_seq, "new message before previous completed");
            }
            self.drop_partial();
        } else if !continues {
            debug!(
                seq = hdr.msg_seq,
                pkt = hdr.pkt_seq,
                current = ?self.current,
                "out of sequence packet"
            );
            self.drop_partial();
            return None;
        }

        self.current = Some((hdr.msg_seq, hdr.pkt_seq));
        self.buf.extend_from_slice(&frame[PACKET_HEADER_LEN..]);
        if hdr.more {
            return None;
        }
        self.current = None;
        Some(Assembled {
            seq: hdr.msg_seq,
            data: std::mem::take(&mut self.buf),
        })
    }
}

/// Outcome of [SequenceTracker::observe].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    First,
    InOrder,
    /// This many messages are missing.
    Gap(u32),
    /// The uplink restarted its sequence.
    Switchover,
    /// A gap too large for the elapsed time, ignored.
    Implausible,
}

/// Tracks the 16 bit message sequence to detect lost messages.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<(u16, Instant)>,
    pub gaps: u64,
    pub missing: u64,
}

impl SequenceTracker {
    /// A jump larger than this to a sequence of 2 or less is a switchover.
    const SWITCHOVER_GAP: u32 = 100;
    const MAX_PER_SEC: u64 = 30;

    pub fn observe(&mut self, seq: u16, now: Instant) -> SeqCheck {
        let Some((last, last_time)) = self.last.replace((seq, now)) else {
            return SeqCheck::First;
        };
        let expected = last.wrapping_add(1);
        if seq == expected {
            return SeqCheck::InOrder;
        }
        let gap = u32::from(seq.wrapping_sub(expected));
        if gap > Self::SWITCHOVER_GAP && seq <= 2 {
            return SeqCheck::Switchover;
        }
        let elapsed = now.saturating_duration_since(last_time).as_secs().max(1);
        if u64::from(gap) > Self::MAX_PER_SEC * elapsed {
            return SeqCheck::Implausible;
        }
        self.gaps += 1;
        self.missing += u64::from(gap);
        SeqCheck::Gap(gap)
    }
}
