//! Satellite downlink input.
//!
//! The downlink is a continuous byte stream of frames, each a 2 byte big-endian
//! length followed by that many bytes beginning with [HDLC_HEADER]. Frames carry
//! packets which are reassembled into GOES DCP messages.
//!
//! ```text
//! | len (2) | 01 00 10 00 | flags (1) | msg seq (2) | pkt seq (1) | data ... |
//! ```
//!
//! Bytes come from a [DownlinkTransport]: a TCP relay or a receiver device.
mod packets;
mod recv;
mod synchronizer;
mod transport;

pub use packets::{
    Assembled, MessageAssembler, PacketHeader, SeqCheck, SequenceTracker, PACKET_HEADER_LEN,
};
pub use recv::{DownlinkRecv, DownlinkStats, LinkStatus};
pub use synchronizer::{
    read_synchronized_frames, Frame, FrameReader, FrameSynchronizer, Mode, HDLC_HEADER,
    MIN_FRAME_LEN,
};
pub use transport::{backend, DeviceTransport, DownlinkTransport, FrameRead, TcpRelayTransport};
