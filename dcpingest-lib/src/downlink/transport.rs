use std::{
    fs::File,
    io::ErrorKind,
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use tracing::{debug, info, warn};

use super::synchronizer::{Frame, FrameReader, MIN_FRAME_LEN};
use crate::config::{DownlinkBackend, DownlinkConfig};
use crate::prelude::*;

/// Result of [DownlinkTransport::read_frame].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    /// A frame of `len` bytes was written to the buffer. `skipped` bytes were
    /// discarded while synchronizing.
    Frame { len: usize, skipped: usize },
    /// Nothing available right now.
    NoData,
    /// Something went wrong but reading may continue. See
    /// [DownlinkTransport::last_error].
    Recoverable,
    /// The transport cannot continue. See [DownlinkTransport::last_error].
    Fatal,
}

/// A source of downlink frames.
pub trait DownlinkTransport: Send {
    /// One-time setup. Failure is fatal for the input.
    ///
    /// # Errors
    /// [Error::TransportInit] if the backend cannot be used.
    fn init(&mut self) -> Result<()>;

    /// Connect or disconnect. May be called repeatedly in any order.
    ///
    /// # Errors
    /// If enabling fails. The transport stays disabled.
    fn set_enabled(&mut self, enabled: bool) -> Result<()>;

    /// Read one frame into `buf`. Must not block for long without returning
    /// [FrameRead::NoData].
    fn read_frame(&mut self, buf: &mut [u8]) -> FrameRead;

    /// Description of the most recent failure.
    fn last_error(&self) -> String;

    fn shutdown(&mut self);

    /// Called after prolonged silence, and periodically while it lasts.
    fn on_timeout(&mut self) {
        if let Err(err) = self.set_enabled(false).and_then(|()| self.set_enabled(true)) {
            warn!("re-enable after timeout failed: {err}");
        }
    }
}

impl<T: DownlinkTransport + ?Sized> DownlinkTransport for Box<T> {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        (**self).set_enabled(enabled)
    }
    fn read_frame(&mut self, buf: &mut [u8]) -> FrameRead {
        (**self).read_frame(buf)
    }
    fn last_error(&self) -> String {
        (**self).last_error()
    }
    fn shutdown(&mut self) {
        (**self).shutdown();
    }
    fn on_timeout(&mut self) {
        (**self).on_timeout();
    }
}

/// Build the transport selected by `cfg.backend`.
#[must_use]
pub fn backend(cfg: &DownlinkConfig) -> Box<dyn DownlinkTransport> {
    match &cfg.backend {
        DownlinkBackend::Tcp { host, port } => Box::new(TcpRelayTransport::new(
            host,
            *port,
            cfg.buffer_capacity,
        )),
        DownlinkBackend::Device { path } => {
            Box::new(DeviceTransport::new(path.clone(), cfg.buffer_capacity))
        }
    }
}

fn copy_frame(frame: &Frame, buf: &mut [u8], last_error: &mut String) -> FrameRead {
    let len = frame.data.len();
    if len > buf.len() {
        *last_error = format!("frame of {len} bytes exceeds buffer of {}", buf.len());
        return FrameRead::Recoverable;
    }
    buf[..len].copy_from_slice(&frame.data);
    FrameRead::Frame {
        len,
        skipped: frame.skipped,
    }
}

fn check_capacity(capacity: usize) -> Result<()> {
    if capacity < MIN_FRAME_LEN {
        return Err(Error::TransportInit(format!(
            "buffer capacity {capacity} is below the minimum frame length {MIN_FRAME_LEN}"
        )));
    }
    Ok(())
}

/// Downlink stream relayed over TCP by a protocol converter.
pub struct TcpRelayTransport {
    host: String,
    port: u16,
    capacity: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    reader: Option<FrameReader<TcpStream>>,
    last_error: String,
}

impl TcpRelayTransport {
    pub fn new(host: &str, port: u16, capacity: usize) -> Self {
        TcpRelayTransport {
            host: host.to_string(),
            port,
            capacity,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(500),
            reader: None,
            last_error: String::new(),
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(Error::Io(last_err.unwrap_or_else(|| ErrorKind::NotFound.into())))
    }
}

impl DownlinkTransport for TcpRelayTransport {
    fn init(&mut self) -> Result<()> {
        check_capacity(self.capacity)?;
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(Error::TransportInit(format!(
                "invalid relay address {}:{}",
                self.host, self.port
            )));
        }
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            if let Some(reader) = self.reader.take() {
                let _ = reader.get_ref().shutdown(std::net::Shutdown::Both);
                debug!(host = %self.host, port = self.port, "relay disconnected");
            }
            return Ok(());
        }
        if self.reader.is_some() {
            return Ok(());
        }
        match self.connect() {
            Ok(stream) => {
                info!(host = %self.host, port = self.port, "relay connected");
                self.reader = Some(FrameReader::new(stream, self.capacity));
                Ok(())
            }
            Err(err) => {
                self.last_error = format!("connect {}:{}: {err}", self.host, self.port);
                Err(err)
            }
        }
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> FrameRead {
        let Some(reader) = self.reader.as_mut() else {
            return FrameRead::NoData;
        };
        match reader.next_frame() {
            Ok(Some(frame)) => copy_frame(&frame, buf, &mut self.last_error),
            Ok(None) => FrameRead::NoData,
            Err(err) => {
                self.last_error = if err.kind() == ErrorKind::UnexpectedEof {
                    "relay closed the connection".to_string()
                } else {
                    format!("relay read failed: {err}")
                };
                // reconnected on the next timeout
                self.reader = None;
                FrameRead::Recoverable
            }
        }
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn shutdown(&mut self) {
        let _ = self.set_enabled(false);
    }
}

/// Downlink receiver exposed as a character device that yields the raw stream.
pub struct DeviceTransport {
    path: PathBuf,
    capacity: usize,
    reader: Option<FrameReader<File>>,
    last_error: String,
}

impl DeviceTransport {
    pub fn new(path: PathBuf, capacity: usize) -> Self {
        DeviceTransport {
            path,
            capacity,
            reader: None,
            last_error: String::new(),
        }
    }
}

impl DownlinkTransport for DeviceTransport {
    fn init(&mut self) -> Result<()> {
        check_capacity(self.capacity)?;
        if !self.path.exists() {
            self.last_error = format!("{} does not exist", self.path.display());
            return Err(Error::TransportInit(self.last_error.clone()));
        }
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            self.reader = None;
            return Ok(());
        }
        if self.reader.is_some() {
            return Ok(());
        }
        match File::open(&self.path) {
            Ok(file) => {
                info!(path = ?self.path, "device opened");
                self.reader = Some(FrameReader::new(file, self.capacity));
                Ok(())
            }
            Err(err) => {
                self.last_error = format!("open {}: {err}", self.path.display());
                Err(Error::Io(err))
            }
        }
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> FrameRead {
        let Some(reader) = self.reader.as_mut() else {
            return FrameRead::NoData;
        };
        match reader.next_frame() {
            Ok(Some(frame)) => copy_frame(&frame, buf, &mut self.last_error),
            // a device with nothing buffered reads as end of file
            Ok(None) => FrameRead::NoData,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => FrameRead::NoData,
            Err(err) => {
                self.last_error = format!("device read failed: {err}");
                FrameRead::Fatal
            }
        }
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn shutdown(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::downlink::synchronizer::HDLC_HEADER;

    #[test]
    fn device_reads_frames_then_no_data() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x55, 0x00, 0x08]).unwrap();
        file.write_all(&HDLC_HEADER).unwrap();
        file.write_all(&[0x00, 0x00, 0x01, 0x01]).unwrap();
        file.flush().unwrap();

        let mut transport = DeviceTransport::new(file.path().to_path_buf(), 64);
        transport.init().unwrap();
        transport.set_enabled(true).unwrap();
        let mut buf = [0u8; 64];

        assert_eq!(
            transport.read_frame(&mut buf),
            FrameRead::Frame { len: 8, skipped: 1 }
        );
        assert_eq!(buf[..4], HDLC_HEADER);
        assert_eq!(transport.read_frame(&mut buf), FrameRead::NoData);
    }

    #[test]
    fn missing_device_fails_init() {
        let mut transport = DeviceTransport::new(PathBuf::from("/nonexistent/dcp0"), 64);
        assert!(matches!(transport.init(), Err(Error::TransportInit(_))));
        assert!(transport.last_error().contains("does not exist"));
    }

    #[test]
    fn tiny_buffer_fails_init() {
        let mut transport = TcpRelayTransport::new("localhost", 1, 4);
        assert!(matches!(transport.init(), Err(Error::TransportInit(_))));
    }

    #[test]
    fn disabled_relay_has_no_data() {
        let mut transport = TcpRelayTransport::new("localhost", 1, 64);
        let mut buf = [0u8; 64];
        assert_eq!(transport.read_frame(&mut buf), FrameRead::NoData);
    }
}
