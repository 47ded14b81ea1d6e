use std::{
    io::{self, BufReader, ErrorKind, Read},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::Utc;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use super::session::SbdSession;
use crate::archive::{ArchiveSink, Archiver};
use crate::config::SbdConfig;
use crate::prelude::*;
use crate::source::{InputSource, SourceId, SourceKind};

/// How often the accept loop checks for a stop request while no gateway connects.
const ACCEPT_POLL: Duration = Duration::from_millis(100);
/// Read timeout used while discarding the rest of a bad session.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Most bytes discarded from a bad session before giving up on the peer.
const DRAIN_LIMIT: u64 = u16::MAX as u64 + 3;

#[derive(Debug, Default)]
struct Counters {
    sessions: AtomicU64,
    errors: AtomicU64,
}

enum State {
    Disabled,
    Listening {
        addr: SocketAddr,
        _tx: Sender<()>,
        handle: JoinHandle<()>,
    },
    Failed(String),
    Shutdown,
}

/// Accepts Iridium gateway connections, one SBD session per connection.
pub struct SbdListener {
    cfg: SbdConfig,
    archiver: Arc<Archiver>,
    counters: Arc<Counters>,
    state: Mutex<State>,
}

impl SbdListener {
    pub fn new(cfg: SbdConfig, sink: Arc<dyn ArchiveSink>) -> Self {
        SbdListener {
            cfg,
            archiver: Arc::new(Archiver::new(
                SourceId::new(SourceKind::Sbd, "iridium-sbd"),
                sink,
            )),
            counters: Arc::default(),
            state: Mutex::new(State::Disabled),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Address actually bound, if listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock() {
            State::Listening { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    fn start(&self) -> Result<State> {
        let addr = self.cfg.socket_addr()?;
        let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let (tx, stop) = bounded(0);
        let archiver = Arc::clone(&self.archiver);
        let counters = Arc::clone(&self.counters);
        let read_timeout = Duration::from_secs(self.cfg.read_timeout_secs);
        let handle = thread::Builder::new()
            .name("sbd-listener".to_string())
            .spawn(move || accept_loop(&listener, &stop, &archiver, &counters, read_timeout))?;

        info!(%addr, "SBD listener started");
        Ok(State::Listening {
            addr,
            _tx: tx,
            handle,
        })
    }
}

fn accept_loop(
    listener: &TcpListener,
    stop: &Receiver<()>,
    archiver: &Arc<Archiver>,
    counters: &Arc<Counters>,
    read_timeout: Duration,
) {
    loop {
        if matches!(stop.try_recv(), Err(TryRecvError::Disconnected)) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let archiver = Arc::clone(archiver);
                let counters = Arc::clone(counters);
                let spawned = thread::Builder::new()
                    .name("sbd-session".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_session(&stream, &archiver, &counters, read_timeout) {
                            warn!(%peer, "SBD session I/O error: {err}");
                        }
                        let _ = stream.shutdown(Shutdown::Both);
                    });
                if let Err(err) = spawned {
                    error!(%peer, "failed to spawn SBD session: {err}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if !matches!(stop.recv_timeout(ACCEPT_POLL), Err(RecvTimeoutError::Timeout)) {
                    break;
                }
            }
            Err(err) => {
                warn!("SBD accept failed: {err}");
                if !matches!(stop.recv_timeout(ACCEPT_POLL), Err(RecvTimeoutError::Timeout)) {
                    break;
                }
            }
        }
    }
    debug!("SBD accept loop exiting");
}

/// Decode one session from `stream` and archive it. A session that violates the
/// protocol is discarded after reading and dropping whatever the peer still sends.
fn handle_session(
    stream: &TcpStream,
    archiver: &Archiver,
    counters: &Counters,
    read_timeout: Duration,
) -> io::Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;
    let peer = stream.peer_addr()?;
    counters.sessions.fetch_add(1, Ordering::Relaxed);

    let mut reader = BufReader::new(stream);
    match SbdSession::read(&mut reader) {
        Ok(session) => {
            debug!(%peer, imei = %session.header.imei, momsn = session.header.momsn, "SBD session");
            archiver.archive(session.into_msg(Utc::now()));
        }
        Err(err) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, "discarding SBD session: {err}");
            stream.set_read_timeout(Some(DRAIN_TIMEOUT))?;
            let drained = io::copy(&mut reader.take(DRAIN_LIMIT), &mut io::sink()).unwrap_or(0);
            debug!(%peer, drained, "drained bad session");
        }
    }
    Ok(())
}

impl InputSource for SbdListener {
    fn enable(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        if !enabled {
            if !matches!(*state, State::Listening { .. }) {
                return Ok(());
            }
            if let State::Listening { addr, _tx: tx, handle } =
                std::mem::replace(&mut *state, State::Disabled)
            {
                // the accept loop stops within ACCEPT_POLL of the sender going away
                drop(tx);
                if handle.join().is_err() {
                    error!(%addr, "SBD accept loop panicked");
                }
                info!(%addr, "SBD listener stopped");
            }
            return Ok(());
        }

        match *state {
            State::Listening { .. } => return Ok(()),
            State::Shutdown => return Err(Error::Shutdown),
            State::Disabled | State::Failed(_) => {}
        }
        match self.start() {
            Ok(listening) => {
                *state = listening;
                Ok(())
            }
            Err(err) => {
                error!("SBD listener failed: {err}");
                *state = State::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn status(&self) -> String {
        let sessions = self.counters.sessions.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        match &*self.lock() {
            State::Disabled => "disabled".to_string(),
            State::Listening { addr, .. } => format!(
                "listening on {addr}, {sessions} sessions, {} messages, {errors} errors",
                self.archiver.archived()
            ),
            State::Failed(reason) => format!("failed: {reason}"),
            State::Shutdown => "shut down".to_string(),
        }
    }

    fn source_id(&self) -> SourceId {
        self.archiver.source().clone()
    }

    fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    fn shutdown(&self) {
        if let Err(err) = self.enable(false) {
            warn!("disable on shutdown failed: {err}");
        }
        *self.lock() = State::Shutdown;
    }
}
