use std::{
    fmt::Display,
    sync::atomic::{AtomicI64, AtomicU8, Ordering},
};

use chrono::{DateTime, Utc};

use crate::config::TargetConfig;
use crate::status::TargetKey;

/// Lifecycle of a [PollTarget].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetState {
    /// Available to be handed to a worker.
    Waiting = 0,
    /// Held by a worker.
    Running = 1,
    /// Removed or superseded by a configuration reload. Workers holding it must
    /// disconnect and let go.
    Dead = 2,
}

impl From<u8> for TargetState {
    fn from(v: u8) -> Self {
        match v {
            0 => TargetState::Waiting,
            1 => TargetState::Running,
            _ => TargetState::Dead,
        }
    }
}

const NEVER: i64 = i64::MIN;

/// A network DCP reachable at a host and port.
///
/// State and last-poll time are atomics so workers can observe `Dead` without taking
/// the scheduler lock. Transitions that must be atomic with target selection are
/// only made by [super::PollScheduler] while it holds its lock.
#[derive(Debug)]
pub struct PollTarget {
    cfg: TargetConfig,
    key: TargetKey,
    state: AtomicU8,
    // Unix millis, NEVER if not yet polled
    last_poll: AtomicI64,
}

impl PollTarget {
    pub fn new(cfg: TargetConfig, last_poll: Option<DateTime<Utc>>) -> Self {
        PollTarget {
            key: TargetKey::from(&cfg),
            cfg,
            state: AtomicU8::new(TargetState::Waiting as u8),
            last_poll: AtomicI64::new(last_poll.map_or(NEVER, |t| t.timestamp_millis())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TargetConfig {
        &self.cfg
    }

    #[must_use]
    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    #[must_use]
    pub fn state(&self) -> TargetState {
        TargetState::from(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state() == TargetState::Dead
    }

    #[must_use]
    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        match self.last_poll.load(Ordering::Acquire) {
            NEVER => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub(crate) fn set_last_poll(&self, t: DateTime<Utc>) {
        self.last_poll.store(t.timestamp_millis(), Ordering::Release);
    }

    /// Waiting -> Running. False if the target was not waiting.
    pub(crate) fn try_start(&self) -> bool {
        self.state
            .compare_exchange(
                TargetState::Waiting as u8,
                TargetState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Running -> Waiting. A dead target stays dead.
    pub(crate) fn release(&self) {
        let _ = self.state.compare_exchange(
            TargetState::Running as u8,
            TargetState::Waiting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_dead(&self) {
        self.state.store(TargetState::Dead as u8, Ordering::Release);
    }
}

impl Display for PollTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PollTarget{{name={}, addr={}, period={}m, state={:?}}}",
            self.cfg.name,
            self.key,
            self.cfg.period_minutes,
            self.state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn target() -> PollTarget {
        PollTarget::new(TargetConfig::new("h", 1, "n", 5), None)
    }

    #[test]
    fn start_and_release() {
        let t = target();
        assert!(t.try_start());
        assert!(!t.try_start(), "already running");
        assert_eq!(t.state(), TargetState::Running);
        t.release();
        assert_eq!(t.state(), TargetState::Waiting);
    }

    #[test]
    fn dead_is_terminal() {
        let t = target();
        assert!(t.try_start());
        t.mark_dead();
        t.release();
        assert!(t.is_dead());
        assert!(!t.try_start());
    }

    #[test]
    fn last_poll_roundtrip() {
        let t = target();
        assert!(t.last_poll().is_none());
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        t.set_last_poll(when);
        assert_eq!(t.last_poll(), Some(when));
    }
}
