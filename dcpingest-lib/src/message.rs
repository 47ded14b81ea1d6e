//! The canonical DCP message record produced by every input.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::source::SourceId;

/// How a message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    NetDcp,
    Iridium,
    Downlink,
}

/// Format of the message contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    /// GOES DCP message with a 37 byte DOMSAT header.
    Goes,
    /// GOES-format message read from a periodically polled network DCP.
    NetDcpPolled,
    /// GOES-format message read from a continuously connected network DCP.
    NetDcpContinuous,
    /// Iridium SBD mobile-originated message.
    Iridium,
}

/// Classification flags carried with every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgFlags {
    /// Message data is present (as opposed to a placeholder for a missing message).
    pub present: bool,
    pub source: SourceType,
    pub msg_type: MsgType,
}

impl MsgFlags {
    #[must_use]
    pub fn new(source: SourceType, msg_type: MsgType) -> Self {
        MsgFlags {
            present: true,
            source,
            msg_type,
        }
    }
}

/// A normalized DCP message.
///
/// Header and payload cannot be changed once the message is built. The originating
/// [SourceId] is stamped by [crate::archive::Archiver] on the way to the archive.
///
/// # Example
/// ```
/// use dcpingest::message::{DcpMsg, MsgFlags, MsgType, SourceType};
///
/// let msg = DcpMsg::builder()
///     .header("ID=300234010123450".to_string())
///     .payload(b"HELLO".to_vec())
///     .flags(MsgFlags::new(SourceType::Iridium, MsgType::Iridium))
///     .failure_code('G')
///     .build();
/// assert_eq!(msg.body().len(), 23);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct DcpMsg {
    header: String,
    payload: Vec<u8>,
    /// Assigned by the owning transport, not globally.
    #[builder(default, setter(strip_option))]
    seq_num: Option<u32>,
    flags: MsgFlags,
    #[builder(default = Utc::now())]
    recv_time: DateTime<Utc>,
    #[builder(default)]
    xmit_time: Option<DateTime<Utc>>,
    #[builder(default = '-')]
    failure_code: char,
    #[builder(default, setter(skip))]
    source: Option<SourceId>,
}

impl DcpMsg {
    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Header bytes followed by the payload, as stored in the archive.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.header.len() + self.payload.len());
        body.extend_from_slice(self.header.as_bytes());
        body.extend_from_slice(&self.payload);
        body
    }

    #[must_use]
    pub fn seq_num(&self) -> Option<u32> {
        self.seq_num
    }

    #[must_use]
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    #[must_use]
    pub fn recv_time(&self) -> DateTime<Utc> {
        self.recv_time
    }

    #[must_use]
    pub fn xmit_time(&self) -> Option<DateTime<Utc>> {
        self.xmit_time
    }

    #[must_use]
    pub fn failure_code(&self) -> char {
        self.failure_code
    }

    /// The input that archived this message, `None` until archived.
    #[must_use]
    pub fn source(&self) -> Option<&SourceId> {
        self.source.as_ref()
    }

    pub(crate) fn sequenced(mut self, seq_num: u32) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    pub(crate) fn stamped(mut self, source: &SourceId) -> Self {
        self.source = Some(source.clone());
        self
    }
}

impl Display for DcpMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DcpMsg{{header: {:?}, seq: {:?}, type: {:?}, payload:[len={}]}}",
            self.header,
            self.seq_num,
            self.flags.msg_type,
            self.payload.len()
        )
    }
}
