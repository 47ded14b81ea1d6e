use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::target::{PollTarget, TargetState};
use crate::config::TargetConfig;
use crate::status::{StatusTable, TargetKey};

/// Polled worker count is `polled targets / POLLED_PER_WORKER`, at least
/// [MIN_POLLED_WORKERS].
const POLLED_PER_WORKER: usize = 10;
const MIN_POLLED_WORKERS: usize = 2;

/// What a reload did to the live target set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub unchanged: usize,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
}

#[derive(Default)]
struct State {
    targets: Vec<Arc<PollTarget>>,
    // Dead targets and when they died, kept until no worker holds them
    graveyard: Vec<(Arc<PollTarget>, Instant)>,
    polled_workers: usize,
}

/// Owns the live [PollTarget] set and decides which target is polled next.
///
/// All operations are atomic with respect to each other.
pub struct PollScheduler {
    state: Mutex<State>,
    status: Arc<StatusTable>,
    dead_grace: Duration,
}

impl PollScheduler {
    /// `status` is used to seed the last-poll time of new targets. Dead targets are
    /// kept for at least `dead_grace` before being reclaimed.
    pub fn new(status: Arc<StatusTable>, dead_grace: Duration) -> Self {
        PollScheduler {
            state: Mutex::new(State {
                polled_workers: MIN_POLLED_WORKERS,
                ..State::default()
            }),
            status,
            dead_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Replace the live target set with `configs`.
    ///
    /// Targets are matched by host and port. A target whose name or period changed is
    /// marked dead and replaced by a new waiting target. Removed targets are marked
    /// dead. Dead targets go to the graveyard until [Self::reap] reclaims them.
    pub fn reload(&self, configs: &[TargetConfig]) -> ReloadSummary {
        let mut state = self.lock();
        let mut summary = ReloadSummary::default();

        let mut previous: HashMap<TargetKey, Arc<PollTarget>> = state
            .targets
            .drain(..)
            .map(|t| (t.key().clone(), t))
            .collect();

        let now = Instant::now();
        let mut targets = Vec::with_capacity(configs.len());
        for cfg in configs {
            let key = TargetKey::from(cfg);
            match previous.remove(&key) {
                Some(old) if old.config() == cfg => {
                    summary.unchanged += 1;
                    targets.push(old);
                }
                Some(old) => {
                    info!(old = %old, period = cfg.period_minutes, name = %cfg.name, "poll target changed");
                    old.mark_dead();
                    state.graveyard.push((old, now));
                    summary.changed += 1;
                    targets.push(Arc::new(self.new_target(cfg)));
                }
                None => {
                    debug!(target = %key, name = %cfg.name, "new poll target");
                    summary.added += 1;
                    targets.push(Arc::new(self.new_target(cfg)));
                }
            }
        }
        for (_, old) in previous {
            info!(old = %old, "poll target removed");
            old.mark_dead();
            state.graveyard.push((old, now));
            summary.removed += 1;
        }
        state.targets = targets;

        let polled = state
            .targets
            .iter()
            .filter(|t| !t.config().is_continuous())
            .count();
        let wanted = (polled / POLLED_PER_WORKER).max(MIN_POLLED_WORKERS);
        state.polled_workers = state.polled_workers.max(wanted);

        info!(
            unchanged = summary.unchanged,
            added = summary.added,
            changed = summary.changed,
            removed = summary.removed,
            polled_workers = state.polled_workers,
            "reloaded poll targets"
        );
        summary
    }

    fn new_target(&self, cfg: &TargetConfig) -> PollTarget {
        let last_poll = self
            .status
            .get(&TargetKey::from(cfg))
            .and_then(|s| s.last_poll_attempt);
        PollTarget::new(cfg.clone(), last_poll)
    }

    /// [Self::next_to_poll_at] the current time.
    pub fn next_to_poll(&self) -> Option<Arc<PollTarget>> {
        self.next_to_poll_at(Utc::now())
    }

    /// Select the waiting polled target most overdue relative to its own period, mark
    /// it running with a last-poll time of `now`, and return it.
    ///
    /// A target is overdue once the time since its last poll is at least its period.
    /// A target never polled is the most overdue; ties go to the earlier target in
    /// configuration order. Returns `None` if no target is overdue.
    pub fn next_to_poll_at(&self, now: DateTime<Utc>) -> Option<Arc<PollTarget>> {
        let state = self.lock();
        let mut best: Option<(&Arc<PollTarget>, f64)> = None;
        for target in &state.targets {
            let period = target.config().period_minutes;
            if period == 0 || target.state() != TargetState::Waiting {
                continue;
            }
            let ratio = match target.last_poll() {
                None => f64::INFINITY,
                Some(last) => {
                    let elapsed = (now - last).num_milliseconds() as f64;
                    elapsed / (f64::from(period) * 60_000.0)
                }
            };
            if ratio < 1.0 {
                continue;
            }
            if best.map_or(true, |(_, r)| ratio > r) {
                best = Some((target, ratio));
            }
        }

        let (target, _) = best?;
        if !target.try_start() {
            return None;
        }
        target.set_last_poll(now);
        Some(Arc::clone(target))
    }

    /// Return a target obtained from [Self::next_to_poll] to the pool.
    pub fn release(&self, target: &PollTarget) {
        let _state = self.lock();
        target.release();
    }

    /// Drop dead targets that have been dead for the grace period and are no longer
    /// held by any worker. Returns the number dropped.
    pub fn reap(&self) -> usize {
        let mut state = self.lock();
        let before = state.graveyard.len();
        let grace = self.dead_grace;
        state
            .graveyard
            .retain(|(t, died)| died.elapsed() < grace || Arc::strong_count(t) > 1);
        let reaped = before - state.graveyard.len();
        if reaped > 0 {
            debug!(reaped, remaining = state.graveyard.len(), "reaped dead targets");
        }
        reaped
    }

    /// Live targets with a zero period.
    #[must_use]
    pub fn continuous_targets(&self) -> Vec<Arc<PollTarget>> {
        self.lock()
            .targets
            .iter()
            .filter(|t| t.config().is_continuous())
            .cloned()
            .collect()
    }

    /// Number of live targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dead targets not yet reclaimed.
    #[must_use]
    pub fn dead_len(&self) -> usize {
        self.lock().graveyard.len()
    }

    /// Polled worker pool size. Never decreases.
    #[must_use]
    pub fn polled_pool_size(&self) -> usize {
        self.lock().polled_workers
    }
}
