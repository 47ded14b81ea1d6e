use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::packets::{Assembled, MessageAssembler, SeqCheck, SequenceTracker};
use super::transport::{DownlinkTransport, FrameRead};
use crate::archive::{ArchiveSink, Archiver};
use crate::config::DownlinkConfig;
use crate::goes::GoesHeader;
use crate::message::{DcpMsg, MsgFlags, MsgType, SourceType};
use crate::prelude::*;
use crate::source::{InputSource, SourceId, SourceKind};

/// Pause after a read that returned nothing.
const NO_DATA_PAUSE: Duration = Duration::from_millis(50);
/// While the link stays silent, the transport's timeout hook is repeated this often.
const TIMEOUT_REPEAT: Duration = Duration::from_secs(60);

/// State of the downlink as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkStatus {
    Init,
    Active,
    Timeout,
    HwError,
    Disabled,
    Shutdown,
}

/// Downlink counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownlinkStats {
    pub frames: u64,
    pub skipped_bytes: u64,
    pub messages: u64,
    pub dropped_short: u64,
    pub dropped_bad_header: u64,
    pub dropped_arms: u64,
    pub dropped_partial: u64,
    pub seq_gaps: u64,
    pub seq_missing: u64,
    pub timeouts: u64,
}

#[derive(Debug)]
struct LinkState {
    status: LinkStatus,
    last_error: String,
    stats: DownlinkStats,
}

#[derive(Debug)]
struct Link(Mutex<LinkState>);

impl Link {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_status(&self, status: LinkStatus) -> LinkStatus {
        std::mem::replace(&mut self.lock().status, status)
    }
}

impl Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: {} frames, {} messages, {} skipped bytes, {} sequence gaps",
            self.status,
            self.stats.frames,
            self.stats.messages,
            self.stats.skipped_bytes,
            self.stats.seq_gaps
        )?;
        if matches!(self.status, LinkStatus::HwError | LinkStatus::Timeout)
            && !self.last_error.is_empty()
        {
            write!(f, " ({})", self.last_error)?;
        }
        Ok(())
    }
}

enum RecvState<T> {
    /// Not running. `initialized` once [DownlinkTransport::init] succeeded.
    Idle { transport: T, initialized: bool },
    Running {
        tx: Sender<()>,
        handle: JoinHandle<T>,
    },
    /// Transport lost, e.g., the reader thread panicked, or init failed.
    Failed,
    Shutdown,
}

/// Satellite downlink input: synchronizes frames from a [DownlinkTransport],
/// reassembles messages and archives the DCP messages among them.
pub struct DownlinkRecv<T: DownlinkTransport + 'static> {
    cfg: DownlinkConfig,
    archiver: Arc<Archiver>,
    link: Arc<Link>,
    state: Mutex<RecvState<T>>,
}

impl<T: DownlinkTransport + 'static> DownlinkRecv<T> {
    pub fn new(cfg: DownlinkConfig, transport: T, sink: Arc<dyn ArchiveSink>) -> Self {
        DownlinkRecv {
            cfg,
            archiver: Arc::new(Archiver::new(
                SourceId::new(SourceKind::Downlink, "downlink"),
                sink,
            )),
            link: Arc::new(Link(Mutex::new(LinkState {
                status: LinkStatus::Disabled,
                last_error: String::new(),
                stats: DownlinkStats::default(),
            }))),
            state: Mutex::new(RecvState::Idle {
                transport,
                initialized: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecvState<T>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        self.link.lock().status
    }

    #[must_use]
    pub fn stats(&self) -> DownlinkStats {
        self.link.lock().stats.clone()
    }

    fn spawn(&self, transport: T) -> Result<RecvState<T>> {
        let (tx, stop) = bounded(0);
        let reader = LinkReader {
            transport,
            cfg: self.cfg.clone(),
            archiver: Arc::clone(&self.archiver),
            link: Arc::clone(&self.link),
            assembler: MessageAssembler::new(),
            seqs: SequenceTracker::default(),
        };
        let handle = thread::Builder::new()
            .name("downlink".to_string())
            .spawn(move || reader.run(&stop))?;
        Ok(RecvState::Running { tx, handle })
    }

    /// Stop the reader thread and recover the transport.
    fn stop(&self, state: &mut RecvState<T>) {
        if let RecvState::Running { tx, handle } = std::mem::replace(state, RecvState::Failed) {
            drop(tx);
            match handle.join() {
                Ok(transport) => {
                    *state = RecvState::Idle {
                        transport,
                        initialized: true,
                    };
                }
                Err(_) => {
                    error!("downlink reader panicked, transport lost");
                    self.link.set_status(LinkStatus::HwError);
                }
            }
        }
    }
}

impl<T: DownlinkTransport + 'static> InputSource for DownlinkRecv<T> {
    fn enable(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        if !enabled {
            if matches!(*state, RecvState::Running { .. }) {
                self.stop(&mut state);
                if matches!(*state, RecvState::Idle { .. }) {
                    self.link.set_status(LinkStatus::Disabled);
                }
                info!("downlink disabled");
            }
            return Ok(());
        }

        match std::mem::replace(&mut *state, RecvState::Failed) {
            // reader stopped on a fatal read
            RecvState::Running { tx, handle } if handle.is_finished() => {
                drop(tx);
                match handle.join() {
                    Ok(mut transport) => transport.shutdown(),
                    Err(_) => error!("downlink reader panicked, transport lost"),
                }
                let mut link = self.link.lock();
                link.status = LinkStatus::HwError;
                Err(Error::Transport(link.last_error.clone()))
            }
            running @ RecvState::Running { .. } => {
                *state = running;
                Ok(())
            }
            RecvState::Shutdown => {
                *state = RecvState::Shutdown;
                Err(Error::Shutdown)
            }
            RecvState::Failed => Err(Error::Transport(self.link.lock().last_error.clone())),
            RecvState::Idle {
                mut transport,
                initialized,
            } => {
                if !initialized {
                    if let Err(err) = transport.init() {
                        error!("downlink transport init failed: {err}");
                        let mut link = self.link.lock();
                        link.status = LinkStatus::HwError;
                        link.last_error = err.to_string();
                        // init failures are not retried
                        return Err(err);
                    }
                }
                self.link.set_status(LinkStatus::Init);
                info!("downlink enabled");
                *state = self.spawn(transport)?;
                Ok(())
            }
        }
    }

    fn status(&self) -> String {
        self.link.lock().to_string()
    }

    fn source_id(&self) -> SourceId {
        self.archiver.source().clone()
    }

    fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        self.stop(&mut state);
        if let RecvState::Idle { transport, .. } = &mut *state {
            transport.shutdown();
        }
        *state = RecvState::Shutdown;
        self.link.set_status(LinkStatus::Shutdown);
        info!("downlink shut down");
    }
}

/// Owns the transport while the reader thread runs.
struct LinkReader<T> {
    transport: T,
    cfg: DownlinkConfig,
    archiver: Arc<Archiver>,
    link: Arc<Link>,
    assembler: MessageAssembler,
    seqs: SequenceTracker,
}

impl<T: DownlinkTransport> LinkReader<T> {
    fn run(mut self, stop: &Receiver<()>) -> T {
        if let Err(err) = self.transport.set_enabled(true) {
            // retried by the timeout hook
            warn!("downlink enable failed: {err}");
            self.link.lock().last_error = err.to_string();
        }

        let timeout = Duration::from_secs(self.cfg.timeout_secs);
        let mut buf = vec![0u8; self.cfg.buffer_capacity];
        let mut last_data = Instant::now();
        let mut last_timeout_call: Option<Instant> = None;

        loop {
            if matches!(stop.try_recv(), Err(TryRecvError::Disconnected)) {
                break;
            }
            let pause = match self.transport.read_frame(&mut buf) {
                FrameRead::Frame { len, skipped } => {
                    last_data = Instant::now();
                    last_timeout_call = None;
                    self.on_frame(&buf[..len], skipped);
                    false
                }
                FrameRead::NoData => true,
                FrameRead::Recoverable => {
                    debug!("downlink read: {}", self.transport.last_error());
                    true
                }
                FrameRead::Fatal => {
                    let err = self.transport.last_error();
                    error!("downlink hardware error: {err}");
                    let mut link = self.link.lock();
                    link.status = LinkStatus::HwError;
                    link.last_error = err;
                    break;
                }
            };

            if last_data.elapsed() >= timeout
                && last_timeout_call.map_or(true, |t| t.elapsed() >= TIMEOUT_REPEAT)
            {
                if self.link.set_status(LinkStatus::Timeout) != LinkStatus::Timeout {
                    warn!(secs = timeout.as_secs(), "no downlink data, link timed out");
                }
                self.link.lock().stats.timeouts += 1;
                self.transport.on_timeout();
                last_timeout_call = Some(Instant::now());
            }

            if pause && !matches!(stop.recv_timeout(NO_DATA_PAUSE), Err(RecvTimeoutError::Timeout)) {
                break;
            }
        }

        if let Err(err) = self.transport.set_enabled(false) {
            warn!("downlink disable failed: {err}");
        }
        self.transport
    }

    fn on_frame(&mut self, frame: &[u8], skipped: usize) {
        {
            let mut link = self.link.lock();
            if link.status == LinkStatus::Timeout {
                info!("downlink recovered");
            }
            link.status = LinkStatus::Active;
            link.stats.frames += 1;
            link.stats.skipped_bytes += skipped as u64;
            link.stats.dropped_partial = self.assembler.dropped;
        }
        if skipped > 0 {
            debug!(skipped, "resynchronized");
        }
        if let Some(msg) = self.assembler.push(frame) {
            self.on_message(msg);
        }
    }

    fn on_message(&mut self, msg: Assembled) {
        let check = self.seqs.observe(msg.seq, Instant::now());
        match check {
            SeqCheck::Gap(missing) => warn!(seq = msg.seq, missing, "downlink sequence gap"),
            SeqCheck::Switchover => info!(seq = msg.seq, "downlink sequence restarted"),
            SeqCheck::Implausible => debug!(seq = msg.seq, "ignoring implausible sequence jump"),
            SeqCheck::First | SeqCheck::InOrder => {}
        }
        let verdict = classify(msg, self.cfg.accept_arms);

        let mut link = self.link.lock();
        link.stats.seq_gaps = self.seqs.gaps;
        link.stats.seq_missing = self.seqs.missing;
        match verdict {
            Classified::Message(dcp) => {
                link.stats.messages += 1;
                drop(link);
                self.archiver.archive(dcp);
            }
            Classified::Short => link.stats.dropped_short += 1,
            Classified::BadHeader => link.stats.dropped_bad_header += 1,
            Classified::Arm => link.stats.dropped_arms += 1,
        }
    }
}

#[derive(Debug)]
enum Classified {
    Message(DcpMsg),
    Short,
    BadHeader,
    Arm,
}

fn classify(msg: Assembled, accept_arms: bool) -> Classified {
    if msg.data.len() < GoesHeader::LEN {
        debug!(seq = msg.seq, len = msg.data.len(), "dropping short message");
        return Classified::Short;
    }
    let Some(header) = GoesHeader::decode(&msg.data) else {
        debug!(seq = msg.seq, "dropping message with invalid header");
        return Classified::BadHeader;
    };
    if !header.is_dcp_message() && !accept_arms {
        debug!(seq = msg.seq, code = %header.failure_code, "dropping ARM");
        return Classified::Arm;
    }
    let end = (GoesHeader::LEN + header.data_length).min(msg.data.len());
    let dcp = DcpMsg::builder()
        .header(String::from_utf8_lossy(&msg.data[..GoesHeader::LEN]).into_owned())
        .payload(msg.data[GoesHeader::LEN..end].to_vec())
        .seq_num(u32::from(msg.seq))
        .flags(MsgFlags::new(SourceType::Downlink, MsgType::Goes))
        .recv_time(Utc::now())
        .xmit_time(header.xmit_time)
        .failure_code(header.failure_code)
        .build();
    Classified::Message(dcp)
}
