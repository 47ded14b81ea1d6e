//! Network DCP inputs: targets polled on a schedule and targets kept connected.
//!
//! [NetDcpRecv] reads the poll-target list on an interval and feeds it to the
//! [PollScheduler]. Targets with a period are polled by a pool of workers
//! ([PolledRecv]); targets with a zero period each get a dedicated worker
//! ([ContinuousRecv]).
mod scheduler;
mod target;
mod transport;
mod worker;

pub use scheduler::{PollScheduler, ReloadSummary};
pub use target::{PollTarget, TargetState};
pub use transport::{
    classify_netdcp, Connector, NetDcpConnector, NetDcpTransport, RawMessage, ReadOutcome,
    Transport, TransportPolicy, Verdict,
};
pub use worker::{drain, DrainEnd, Drained};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use threadpool::ThreadPool;
use tracing::{error, info, warn};

use crate::archive::{ArchiveSink, Archiver};
use crate::config::{load_targets, NetDcpConfig};
use crate::prelude::*;
use crate::source::{InputSource, SourceId, SourceKind};
use crate::status::{StatusTable, TargetKey};

/// State shared by the reload timer and every worker.
pub(crate) struct Shared<C: Connector> {
    pub(crate) cfg: NetDcpConfig,
    pub(crate) scheduler: PollScheduler,
    pub(crate) status: Arc<StatusTable>,
    pub(crate) connector: C,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Workers started by one `enable(true)`. Dropping it stops them.
struct Generation {
    // never sent on; dropping it disconnects `stop`
    _tx: Sender<()>,
    stop: Receiver<()>,
    workers: Arc<AtomicUsize>,
}

impl Generation {
    fn new() -> Self {
        let (tx, stop) = bounded(0);
        Generation {
            _tx: tx,
            stop,
            workers: Arc::default(),
        }
    }
}

struct WorkerCount(Arc<AtomicUsize>);

impl Drop for WorkerCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Network DCPs polled on their configured period by a shared worker pool.
pub struct PolledRecv<C: Connector> {
    shared: Arc<Shared<C>>,
    archiver: Arc<Archiver>,
    pool: Mutex<ThreadPool>,
    generation: Mutex<Option<Generation>>,
}

impl<C: Connector> PolledRecv<C> {
    fn new(shared: Arc<Shared<C>>, sink: Arc<dyn ArchiveSink>) -> Self {
        let size = shared.scheduler.polled_pool_size();
        PolledRecv {
            shared,
            archiver: Arc::new(Archiver::new(
                SourceId::new(SourceKind::Polled, "netdcp-polled"),
                sink,
            )),
            pool: Mutex::new(
                threadpool::Builder::new()
                    .num_threads(size)
                    .thread_name("polled-worker".to_string())
                    .build(),
            ),
            generation: Mutex::default(),
        }
    }

    /// Grow the worker pool to the scheduler's pool size.
    fn ensure_workers(&self) {
        let generation = lock(&self.generation);
        let Some(gen) = generation.as_ref() else {
            return;
        };
        let wanted = self.shared.scheduler.polled_pool_size();
        let mut pool = lock(&self.pool);
        if pool.max_count() < wanted {
            info!(from = pool.max_count(), to = wanted, "growing polled worker pool");
            pool.set_num_threads(wanted);
        }
        while gen.workers.load(Ordering::SeqCst) < wanted {
            gen.workers.fetch_add(1, Ordering::SeqCst);
            let count = WorkerCount(Arc::clone(&gen.workers));
            let shared = Arc::clone(&self.shared);
            let archiver = Arc::clone(&self.archiver);
            let stop = gen.stop.clone();
            pool.execute(move || {
                let _count = count;
                worker::polled_worker(&shared, &archiver, &stop);
            });
        }
    }

    /// Number of workers currently running.
    #[must_use]
    pub fn workers(&self) -> usize {
        lock(&self.generation)
            .as_ref()
            .map_or(0, |g| g.workers.load(Ordering::SeqCst))
    }
}

impl<C: Connector> InputSource for PolledRecv<C> {
    fn enable(&self, enabled: bool) -> Result<()> {
        {
            let mut generation = lock(&self.generation);
            if !enabled {
                if generation.take().is_some() {
                    info!("polled input disabled");
                }
                return Ok(());
            }
            if generation.is_none() {
                info!("polled input enabled");
                *generation = Some(Generation::new());
            }
        }
        self.ensure_workers();
        Ok(())
    }

    fn status(&self) -> String {
        if lock(&self.generation).is_none() {
            return "disabled".to_string();
        }
        format!(
            "polling {} targets with {} workers, {} messages",
            self.shared.scheduler.len() - self.shared.scheduler.continuous_targets().len(),
            self.workers(),
            self.archiver.archived()
        )
    }

    fn source_id(&self) -> SourceId {
        self.archiver.source().clone()
    }

    fn archiver(&self) -> &Archiver {
        &self.archiver
    }
}

struct ContinuousWorker {
    target: Arc<PollTarget>,
    handle: JoinHandle<()>,
}

/// Network DCPs kept connected at all times, one thread per target.
pub struct ContinuousRecv<C: Connector> {
    shared: Arc<Shared<C>>,
    archiver: Arc<Archiver>,
    generation: Mutex<Option<Generation>>,
    workers: Mutex<HashMap<TargetKey, ContinuousWorker>>,
}

impl<C: Connector> ContinuousRecv<C> {
    fn new(shared: Arc<Shared<C>>, sink: Arc<dyn ArchiveSink>) -> Self {
        ContinuousRecv {
            shared,
            archiver: Arc::new(Archiver::new(
                SourceId::new(SourceKind::Continuous, "netdcp-continuous"),
                sink,
            )),
            generation: Mutex::default(),
            workers: Mutex::default(),
        }
    }

    /// Start a worker for every live continuous target that does not have one.
    /// Workers exit on their own when their target dies.
    fn reconcile(&self) {
        let generation = lock(&self.generation);
        let Some(gen) = generation.as_ref() else {
            return;
        };
        let mut workers = lock(&self.workers);
        workers.retain(|_, w| !w.handle.is_finished());

        for target in self.shared.scheduler.continuous_targets() {
            if workers
                .get(target.key())
                .is_some_and(|w| Arc::ptr_eq(&w.target, &target))
            {
                continue;
            }
            let shared = Arc::clone(&self.shared);
            let archiver = Arc::clone(&self.archiver);
            let stop = gen.stop.clone();
            let bound = Arc::clone(&target);
            let spawned = thread::Builder::new()
                .name(format!("continuous-{}", target.name()))
                .spawn(move || worker::continuous_worker(&shared, &archiver, &bound, &stop));
            match spawned {
                Ok(handle) => {
                    workers.insert(target.key().clone(), ContinuousWorker { target, handle });
                }
                Err(err) => error!(target = %target.key(), "failed to spawn continuous worker: {err}"),
            }
        }
    }

    /// Number of worker threads still running.
    #[must_use]
    pub fn workers(&self) -> usize {
        lock(&self.workers)
            .values()
            .filter(|w| !w.handle.is_finished())
            .count()
    }
}

impl<C: Connector> InputSource for ContinuousRecv<C> {
    fn enable(&self, enabled: bool) -> Result<()> {
        {
            let mut generation = lock(&self.generation);
            if !enabled {
                if generation.take().is_some() {
                    info!("continuous input disabled");
                }
                // Stopped workers exit within one idle timeout
                lock(&self.workers).clear();
                return Ok(());
            }
            if generation.is_none() {
                info!("continuous input enabled");
                *generation = Some(Generation::new());
            }
        }
        self.reconcile();
        Ok(())
    }

    fn status(&self) -> String {
        if lock(&self.generation).is_none() {
            return "disabled".to_string();
        }
        format!(
            "{} connected targets, {} messages",
            self.workers(),
            self.archiver.archived()
        )
    }

    fn source_id(&self) -> SourceId {
        self.archiver.source().clone()
    }

    fn archiver(&self) -> &Archiver {
        &self.archiver
    }
}

struct Inner<C: Connector> {
    shared: Arc<Shared<C>>,
    polled: PolledRecv<C>,
    continuous: ContinuousRecv<C>,
    // reloads never run concurrently
    reload_lock: Mutex<()>,
}

impl<C: Connector> Inner<C> {
    fn reload(&self) -> Result<ReloadSummary> {
        let _guard = lock(&self.reload_lock);
        let result = load_targets(&self.shared.cfg.targets_file).map(|targets| {
            for t in &targets {
                self.shared.status.upsert(t);
            }
            let summary = self.shared.scheduler.reload(&targets);
            self.polled.ensure_workers();
            self.continuous.reconcile();
            summary
        });
        self.shared.scheduler.reap();
        result
    }
}

/// Owns the [PollScheduler], its reload timer and the two network DCP inputs.
pub struct NetDcpRecv<C: Connector = NetDcpConnector> {
    inner: Arc<Inner<C>>,
    reload_thread: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl NetDcpRecv<NetDcpConnector> {
    /// Network DCP inputs connecting over TCP with the timeouts in `cfg`.
    pub fn new(cfg: NetDcpConfig, status: Arc<StatusTable>, sink: Arc<dyn ArchiveSink>) -> Self {
        let connector = NetDcpConnector {
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
        };
        Self::with_connector(cfg, status, sink, connector)
    }
}

impl<C: Connector> NetDcpRecv<C> {
    pub fn with_connector(
        cfg: NetDcpConfig,
        status: Arc<StatusTable>,
        sink: Arc<dyn ArchiveSink>,
        connector: C,
    ) -> Self {
        let scheduler =
            PollScheduler::new(Arc::clone(&status), Duration::from_secs(cfg.dead_grace_secs));
        let shared = Arc::new(Shared {
            cfg,
            scheduler,
            status,
            connector,
        });
        NetDcpRecv {
            inner: Arc::new(Inner {
                polled: PolledRecv::new(Arc::clone(&shared), Arc::clone(&sink)),
                continuous: ContinuousRecv::new(Arc::clone(&shared), sink),
                shared,
                reload_lock: Mutex::default(),
            }),
            reload_thread: Mutex::default(),
        }
    }

    #[must_use]
    pub fn polled(&self) -> &PolledRecv<C> {
        &self.inner.polled
    }

    #[must_use]
    pub fn continuous(&self) -> &ContinuousRecv<C> {
        &self.inner.continuous
    }

    #[must_use]
    pub fn scheduler(&self) -> &PollScheduler {
        &self.inner.shared.scheduler
    }

    #[must_use]
    pub fn status_table(&self) -> &Arc<StatusTable> {
        &self.inner.shared.status
    }

    /// Both inputs, for callers that manage inputs uniformly.
    #[must_use]
    pub fn inputs(&self) -> [&dyn InputSource; 2] {
        [&self.inner.polled, &self.inner.continuous]
    }

    /// Re-read the poll-target list now. On error the live target set is unchanged.
    ///
    /// # Errors
    /// If the target list cannot be read or is not a JSON array.
    pub fn reload_now(&self) -> Result<ReloadSummary> {
        self.inner.reload()
    }

    /// Load the target list, enable both inputs and start the reload timer.
    ///
    /// A target list that cannot be loaded is logged and retried on the next reload.
    ///
    /// # Errors
    /// If the reload thread cannot be started.
    pub fn start(&self) -> Result<()> {
        if let Err(err) = self.reload_now() {
            warn!(path = ?self.inner.shared.cfg.targets_file, "initial target load failed: {err}");
        }
        for input in self.inputs() {
            input.enable(true)?;
        }

        let mut reload_thread = lock(&self.reload_thread);
        if reload_thread.is_some() {
            return Ok(());
        }
        let (tx, rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_secs(inner.shared.cfg.reload_interval_secs);
        let handle = thread::Builder::new()
            .name("netdcp-reload".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = inner.reload() {
                            warn!(path = ?inner.shared.cfg.targets_file, "target reload failed: {err}");
                        }
                    }
                    _ => break,
                }
            })?;
        *reload_thread = Some((tx, handle));
        Ok(())
    }

    /// Stop the reload timer and both inputs.
    pub fn shutdown(&self) {
        if let Some((tx, handle)) = lock(&self.reload_thread).take() {
            drop(tx);
            if handle.join().is_err() {
                error!("reload thread panicked");
            }
        }
        for input in self.inputs() {
            input.shutdown();
        }
        info!("network DCP inputs shut down");
    }
}
