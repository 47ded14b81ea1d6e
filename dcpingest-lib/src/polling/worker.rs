//! The connect/read loop shared by polled and continuous workers.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, info, trace, warn};

use super::target::PollTarget;
use super::transport::{Connector, ReadOutcome, Transport, TransportPolicy, Verdict};
use super::Shared;
use crate::archive::Archiver;
use crate::message::DcpMsg;
use crate::prelude::*;
use crate::status::PollResult;

/// How long a polled worker waits before asking again when no target is overdue.
const NO_TARGET_NAP: Duration = Duration::from_millis(500);
/// Granularity at which a sleeping continuous worker checks its target.
const DEAD_CHECK: Duration = Duration::from_secs(1);

/// True once the stop channel's sender has been dropped.
pub(crate) fn stopped(stop: &Receiver<()>) -> bool {
    matches!(stop.try_recv(), Err(TryRecvError::Disconnected))
}

/// Sleep for `dur`, returning early with true if stopped.
pub(crate) fn nap(stop: &Receiver<()>, dur: Duration) -> bool {
    !matches!(stop.recv_timeout(dur), Err(RecvTimeoutError::Timeout))
}

/// Why [drain] returned.
#[derive(Debug)]
pub enum DrainEnd {
    /// Remote signalled it has nothing more.
    NoMoreData,
    /// Idle timeout expired and the policy ends sessions on idle.
    Idle,
    /// The target died.
    Dead,
    /// The input was disabled.
    Stopped,
    Failed(Error),
}

#[derive(Debug)]
pub struct Drained {
    pub messages: u64,
    pub end: DrainEnd,
}

impl Drained {
    /// A session succeeds if it ended with an explicit no-more-data from the remote,
    /// or produced a message and did not end in an error.
    #[must_use]
    pub fn success(&self) -> bool {
        match self.end {
            DrainEnd::NoMoreData => true,
            DrainEnd::Failed(_) => false,
            _ => self.messages > 0,
        }
    }
}

/// Read messages from a connected transport until it has no more, times out (if
/// `policy` says so), fails, or `target` dies. Accepted messages are passed to
/// `deliver`.
///
/// `target` and `stop` are checked before every read.
pub fn drain<T: Transport>(
    transport: &mut T,
    target: &PollTarget,
    policy: &TransportPolicy,
    stop: &Receiver<()>,
    mut deliver: impl FnMut(DcpMsg),
) -> Drained {
    let mut messages = 0;
    let end = loop {
        if target.is_dead() {
            break DrainEnd::Dead;
        }
        if stopped(stop) {
            break DrainEnd::Stopped;
        }
        match transport.read_one() {
            Ok(ReadOutcome::Message(raw)) => match transport.classify(raw, policy, Utc::now()) {
                Verdict::Archive(msg) => {
                    trace!(target = %target.key(), "{msg}");
                    deliver(msg);
                    messages += 1;
                }
                Verdict::Discard(reason) => debug!(target = %target.key(), "discarding: {reason}"),
            },
            Ok(ReadOutcome::Idle) => {
                if policy.stop_on_idle {
                    break DrainEnd::Idle;
                }
            }
            Ok(ReadOutcome::NoMoreData) => break DrainEnd::NoMoreData,
            Err(err) => break DrainEnd::Failed(err),
        }
    };
    Drained { messages, end }
}

fn sequenced(archiver: &Archiver) -> impl FnMut(DcpMsg) + '_ {
    move |msg| archiver.archive(msg.sequenced(archiver.next_seq()))
}

/// One connect/drain/disconnect session against `target`, recorded in the status
/// table.
pub(crate) fn poll_target<C: Connector>(
    shared: &Shared<C>,
    archiver: &Archiver,
    target: &PollTarget,
    policy: &TransportPolicy,
    stop: &Receiver<()>,
) -> PollResult {
    let key = target.key();
    shared.status.record_attempt(key, Utc::now());

    let mut transport = shared.connector.transport(target.config());
    let result = match transport.connect() {
        Err(err) => {
            warn!(target = %key, name = target.name(), "connect failed: {err}");
            PollResult {
                success: false,
                messages: 0,
            }
        }
        Ok(()) => {
            let drained = drain(&mut transport, target, policy, stop, sequenced(archiver));
            transport.disconnect();
            match &drained.end {
                DrainEnd::Failed(err) => {
                    warn!(target = %key, messages = drained.messages, "poll failed: {err}");
                }
                DrainEnd::Dead => info!(target = %key, "target removed mid-poll"),
                end => debug!(target = %key, messages = drained.messages, ?end, "poll done"),
            }
            PollResult {
                success: drained.success(),
                messages: drained.messages,
            }
        }
    };
    shared.status.record_poll(key, result, Utc::now());
    result
}

/// Body of a polled worker: poll overdue targets until stopped.
pub(crate) fn polled_worker<C: Connector>(
    shared: &Shared<C>,
    archiver: &Archiver,
    stop: &Receiver<()>,
) {
    let policy = TransportPolicy::polled(shared.cfg.max_msg_age());
    debug!("polled worker starting");
    loop {
        if stopped(stop) {
            break;
        }
        let Some(target) = shared.scheduler.next_to_poll() else {
            if nap(stop, NO_TARGET_NAP) {
                break;
            }
            continue;
        };
        poll_target(shared, archiver, &target, &policy, stop);
        shared.scheduler.release(&target);
    }
    debug!("polled worker exiting");
}

/// Body of a continuous worker: keep `target` connected until it dies or the input
/// is stopped, reconnecting after a fixed delay.
pub(crate) fn continuous_worker<C: Connector>(
    shared: &Shared<C>,
    archiver: &Archiver,
    target: &Arc<PollTarget>,
    stop: &Receiver<()>,
) {
    let policy = TransportPolicy::continuous();
    let reconnect = Duration::from_secs(shared.cfg.reconnect_delay_secs);
    let key = target.key();
    info!(target = %key, name = target.name(), "continuous worker starting");

    while !target.is_dead() && !stopped(stop) {
        shared.status.record_attempt(key, Utc::now());
        let mut transport = shared.connector.transport(target.config());
        let good = match transport.connect() {
            Err(err) => {
                warn!(target = %key, "connect failed: {err}");
                false
            }
            Ok(()) => {
                let mut deliver = sequenced(archiver);
                let drained = drain(&mut transport, target, &policy, stop, |msg| {
                    deliver(msg);
                    shared.status.record_contact(key, 1, Utc::now());
                });
                transport.disconnect();
                match &drained.end {
                    DrainEnd::Failed(err) => warn!(target = %key, "connection lost: {err}"),
                    end => debug!(target = %key, ?end, "session ended"),
                }
                drained.success()
            }
        };
        // messages were counted as they arrived
        shared.status.record_poll(
            key,
            PollResult {
                success: good,
                messages: 0,
            },
            Utc::now(),
        );

        // Sleep out the reconnect delay, watching for death
        let mut remaining = reconnect;
        while !remaining.is_zero() && !target.is_dead() {
            let step = remaining.min(DEAD_CHECK);
            if nap(stop, step) {
                break;
            }
            remaining -= step;
        }
    }
    info!(target = %key, dead = target.is_dead(), "continuous worker exiting");
}
