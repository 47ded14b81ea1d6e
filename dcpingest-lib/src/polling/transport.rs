use std::{
    io::{self, BufReader, ErrorKind, Read},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::TargetConfig;
use crate::goes::GoesHeader;
use crate::message::{DcpMsg, MsgFlags, MsgType, SourceType};
use crate::prelude::*;

/// A GOES-format message as read off the wire.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: GoesHeader,
    /// The header bytes as text.
    pub header_text: String,
    pub data: Vec<u8>,
}

/// Result of one [Transport::read_one].
#[derive(Debug)]
pub enum ReadOutcome {
    Message(RawMessage),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The remote has no more data for this session.
    NoMoreData,
}

/// What a transport does with a message it has read.
#[derive(Debug)]
pub enum Verdict {
    Archive(DcpMsg),
    /// Not archived, with the reason.
    Discard(String),
}

/// Per-variant behavior of the shared read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportPolicy {
    /// Messages transmitted longer ago than this are discarded.
    pub max_age: Option<Duration>,
    pub msg_type: MsgType,
    /// End the session when the idle timeout expires. Otherwise keep reading.
    pub stop_on_idle: bool,
}

impl TransportPolicy {
    /// Periodically polled DCPs.
    #[must_use]
    pub fn polled(max_age: Duration) -> Self {
        TransportPolicy {
            max_age: Some(max_age),
            msg_type: MsgType::NetDcpPolled,
            stop_on_idle: true,
        }
    }

    /// Continuously connected DCPs.
    #[must_use]
    pub fn continuous() -> Self {
        TransportPolicy {
            max_age: None,
            msg_type: MsgType::NetDcpContinuous,
            stop_on_idle: false,
        }
    }
}

/// The capabilities the worker loop needs from a connection to a DCP.
pub trait Transport {
    /// # Errors
    /// If the remote cannot be reached.
    fn connect(&mut self) -> Result<()>;

    /// Read one message, blocking no longer than the idle timeout.
    ///
    /// # Errors
    /// On I/O failure or a malformed message. The session cannot continue after an
    /// error.
    fn read_one(&mut self) -> Result<ReadOutcome>;

    fn disconnect(&mut self);

    /// Turn a raw message into a canonical one, or decide not to archive it.
    fn classify(&self, raw: RawMessage, policy: &TransportPolicy, now: DateTime<Utc>) -> Verdict {
        classify_netdcp(raw, policy, now)
    }
}

/// Creates a [Transport] for a target. One transport is used per session.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn transport(&self, cfg: &TargetConfig) -> Self::Transport;
}

/// Network DCP message classification shared by the polled and continuous variants.
#[must_use]
pub fn classify_netdcp(raw: RawMessage, policy: &TransportPolicy, now: DateTime<Utc>) -> Verdict {
    if let (Some(max_age), Some(xmit)) = (policy.max_age, raw.header.xmit_time) {
        let age = (now - xmit).to_std().unwrap_or_default();
        if age > max_age {
            return Verdict::Discard(format!(
                "{} transmitted {xmit} is older than {}h",
                raw.header.address,
                max_age.as_secs() / 3600
            ));
        }
    }
    let msg = DcpMsg::builder()
        .header(raw.header_text)
        .payload(raw.data)
        .flags(MsgFlags::new(SourceType::NetDcp, policy.msg_type))
        .recv_time(now)
        .xmit_time(raw.header.xmit_time)
        .failure_code('G')
        .build();
    Verdict::Archive(msg)
}

/// [Connector] for [NetDcpTransport].
#[derive(Debug, Clone, Copy)]
pub struct NetDcpConnector {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Connector for NetDcpConnector {
    type Transport = NetDcpTransport;

    fn transport(&self, cfg: &TargetConfig) -> NetDcpTransport {
        NetDcpTransport::new(cfg, self.connect_timeout, self.idle_timeout)
    }
}

/// TCP connection to a network DCP that sends a stream of GOES-header messages and
/// closes the connection when it has nothing more to send.
pub struct NetDcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    idle_timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

impl NetDcpTransport {
    pub fn new(cfg: &TargetConfig, connect_timeout: Duration, idle_timeout: Duration) -> Self {
        NetDcpTransport {
            host: cfg.host.clone(),
            port: cfg.port,
            connect_timeout,
            idle_timeout,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::from(ErrorKind::NotConnected)))
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl Transport for NetDcpTransport {
    fn connect(&mut self) -> Result<()> {
        let mut last_err = io::Error::new(
            ErrorKind::NotFound,
            format!("{}:{} did not resolve", self.host, self.port),
        );
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.idle_timeout))?;
                    debug!(%addr, "connected");
                    self.stream = Some(BufReader::new(stream));
                    return Ok(());
                }
                Err(err) => last_err = err,
            }
        }
        Err(Error::Io(last_err))
    }

    fn read_one(&mut self) -> Result<ReadOutcome> {
        let stream = self.stream()?;
        let mut hdr = [0u8; GoesHeader::LEN];

        // Timeout or EOF before the first byte of a header are not errors
        let mut filled = 0;
        while filled < hdr.len() {
            match stream.read(&mut hdr[filled..]) {
                Ok(0) if filled == 0 => return Ok(ReadOutcome::NoMoreData),
                Ok(0) => {
                    return Err(Error::Protocol(format!(
                        "connection closed after {filled} header bytes"
                    )))
                }
                Ok(n) => filled += n,
                Err(err) if filled == 0 && is_timeout(&err) => return Ok(ReadOutcome::Idle),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }

        let Some(header) = GoesHeader::decode(&hdr) else {
            return Err(Error::Protocol(format!(
                "invalid message header {:?}",
                String::from_utf8_lossy(&hdr)
            )));
        };
        let mut data = vec![0u8; header.data_length];
        stream.read_exact(&mut data)?;
        trace!(address = %header.address, len = data.len(), "read message");

        Ok(ReadOutcome::Message(RawMessage {
            header_text: String::from_utf8_lossy(&hdr).into_owned(),
            header,
            data,
        }))
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.get_ref().shutdown(std::net::Shutdown::Both);
        }
    }
}
