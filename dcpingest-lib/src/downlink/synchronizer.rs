use std::io::{ErrorKind, Read};

use tracing::{debug, trace};

use crate::prelude::*;

/// HDLC header that starts every downlink frame.
pub const HDLC_HEADER: [u8; 4] = [0x01, 0x00, 0x10, 0x00];
/// Smallest valid frame: the header plus the 4 byte packet header.
pub const MIN_FRAME_LEN: usize = 8;

// Length prefix plus header
const WINDOW_LEN: usize = 2 + HDLC_HEADER.len();

/// Synchronizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Searching for a length prefix followed by [HDLC_HEADER].
    Hunt,
    /// Expecting the high byte of the next frame's length.
    ReadLengthHigh,
    /// Expecting the low byte of the next frame's length.
    ReadLengthLow,
    /// Filling the current frame.
    ReadData,
}

/// A synchronized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame bytes starting with [HDLC_HEADER]. The length prefix is not included.
    pub data: Vec<u8>,
    /// Bytes discarded since the previous frame while hunting for this one.
    pub skipped: usize,
}

/// Byte-at-a-time frame synchronization for the downlink stream.
///
/// Each frame is a 2 byte big-endian length followed by that many bytes, the first
/// four of which are [HDLC_HEADER]. Once locked, the synchronizer expects frames
/// back to back and reads the next length directly. Any invalid length, or a frame
/// that does not start with the header, drops it back to hunting.
///
/// # Example
/// ```
/// use dcpingest::downlink::FrameSynchronizer;
///
/// let mut sync = FrameSynchronizer::new(1024);
/// let stream = [0xaa, 0x00, 0x08, 0x01, 0x00, 0x10, 0x00, 0x80, 0x00, 0x01, 0x01];
/// let frames: Vec<_> = stream.iter().filter_map(|b| sync.push(*b)).collect();
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].skipped, 1);
/// assert_eq!(frames[0].data.len(), 8);
/// ```
#[derive(Debug)]
pub struct FrameSynchronizer {
    mode: Mode,
    capacity: usize,
    window: [u8; WINDOW_LEN],
    window_len: usize,
    len_high: u8,
    expected: usize,
    buf: Vec<u8>,
    skipped: usize,
}

impl FrameSynchronizer {
    /// `capacity` is the largest frame accepted.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        FrameSynchronizer {
            mode: Mode::Hunt,
            capacity,
            window: [0; WINDOW_LEN],
            window_len: 0,
            len_high: 0,
            expected: 0,
            buf: Vec::with_capacity(capacity),
            skipped: 0,
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bytes discarded so far while hunting for the next frame.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn valid_len(&self, len: usize) -> bool {
        (MIN_FRAME_LEN..=self.capacity).contains(&len)
    }

    fn hunt(&mut self, seed: &[u8]) {
        self.mode = Mode::Hunt;
        self.window_len = 0;
        for b in seed {
            self.slide(*b);
        }
    }

    // Add a byte to the hunt window, counting the byte that falls out as skipped.
    fn slide(&mut self, b: u8) {
        if self.window_len == WINDOW_LEN {
            self.window.copy_within(1.., 0);
            self.window[WINDOW_LEN - 1] = b;
            self.skipped += 1;
        } else {
            self.window[self.window_len] = b;
            self.window_len += 1;
        }
    }

    fn start_frame(&mut self, len: usize) {
        self.expected = len;
        self.buf.clear();
        self.mode = Mode::ReadData;
    }

    /// Feed one byte, returning a frame if this byte completed one.
    pub fn push(&mut self, b: u8) -> Option<Frame> {
        match self.mode {
            Mode::Hunt => {
                self.slide(b);
                if self.window_len == WINDOW_LEN && self.window[2..] == HDLC_HEADER {
                    let len = usize::from(u16::from_be_bytes([self.window[0], self.window[1]]));
                    if self.valid_len(len) {
                        trace!(len, skipped = self.skipped, "sync found");
                        self.start_frame(len);
                        self.buf.extend_from_slice(&HDLC_HEADER);
                        self.window_len = 0;
                        return self.complete();
                    }
                    trace!(len, "header with invalid length");
                }
                None
            }
            Mode::ReadLengthHigh => {
                self.len_high = b;
                self.mode = Mode::ReadLengthLow;
                None
            }
            Mode::ReadLengthLow => {
                let len = usize::from(u16::from_be_bytes([self.len_high, b]));
                if self.valid_len(len) {
                    self.start_frame(len);
                } else {
                    debug!(len, "invalid frame length, resynchronizing");
                    self.hunt(&[self.len_high, b]);
                }
                None
            }
            Mode::ReadData => {
                self.buf.push(b);
                self.complete()
            }
        }
    }

    fn complete(&mut self) -> Option<Frame> {
        if self.buf.len() < self.expected {
            return None;
        }
        if self.buf[..HDLC_HEADER.len()] != HDLC_HEADER {
            debug!(len = self.expected, "frame header mismatch, resynchronizing");
            self.skipped += self.expected + 2;
            self.buf.clear();
            self.hunt(&[]);
            return None;
        }
        self.mode = Mode::ReadLengthHigh;
        let frame = Frame {
            data: std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity)),
            skipped: std::mem::take(&mut self.skipped),
        };
        Some(frame)
    }
}

/// Reads synchronized frames from a byte stream.
///
/// A read that times out yields `Ok(None)` from [FrameReader::next_frame] so callers
/// can check for cancellation; bytes already read are kept.
pub struct FrameReader<R>
where
    R: Read + Send,
{
    reader: R,
    sync: FrameSynchronizer,
    chunk: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl<R> FrameReader<R>
where
    R: Read + Send,
{
    pub fn new(reader: R, capacity: usize) -> Self {
        FrameReader {
            reader,
            sync: FrameSynchronizer::new(capacity),
            chunk: vec![0u8; 4096].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    #[must_use]
    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.sync
    }

    #[must_use]
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Next complete frame.
    ///
    /// # Errors
    /// [ErrorKind::UnexpectedEof] when the reader is exhausted, or any other read
    /// error. Reading may be retried after an error.
    pub fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            while self.pos < self.len {
                let b = self.chunk[self.pos];
                self.pos += 1;
                if let Some(frame) = self.sync.push(b) {
                    return Ok(Some(frame));
                }
            }
            match self.reader.read(&mut self.chunk) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl<R> Iterator for FrameReader<R>
where
    R: Read + Send,
{
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return None,
                Err(err) => return Some(Err(Error::Io(err))),
            }
        }
    }
}

/// Creates an iterator over the synchronized frames in `reader`.
///
/// A partial frame at the end of the stream is dropped. For more control see
/// [FrameReader] and [FrameSynchronizer].
///
/// # Errors
/// Read errors other than end of stream are passed on.
pub fn read_synchronized_frames<'a, R>(
    reader: R,
    capacity: usize,
) -> impl Iterator<Item = Result<Frame>> + 'a
where
    R: Read + Send + 'a,
{
    FrameReader::new(reader, capacity)
}
