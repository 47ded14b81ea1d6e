//! Per-target health counters and their checkpoint file.
use std::{
    collections::HashMap,
    fmt::Display,
    fs,
    io::Write,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::prelude::*;

/// Identity of a poll target: where it is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub host: String,
    pub port: u16,
}

impl TargetKey {
    pub fn new(host: &str, port: u16) -> Self {
        TargetKey {
            host: host.to_string(),
            port,
        }
    }
}

impl From<&TargetConfig> for TargetKey {
    fn from(cfg: &TargetConfig) -> Self {
        TargetKey::new(&cfg.host, cfg.port)
    }
}

impl Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Health counters for one poll target.
///
/// Lives independently of the target itself so it can still be reported, and
/// checkpointed, for a while after the target is removed from the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub period_minutes: u32,
    pub last_poll_attempt: Option<DateTime<Utc>>,
    pub last_contact: Option<DateTime<Utc>>,
    pub good_polls: u64,
    pub failed_polls: u64,
    pub messages: u64,
}

impl SourceStatus {
    fn new(cfg: &TargetConfig) -> Self {
        SourceStatus {
            host: cfg.host.clone(),
            port: cfg.port,
            name: cfg.name.clone(),
            period_minutes: cfg.period_minutes,
            last_poll_attempt: None,
            last_contact: None,
            good_polls: 0,
            failed_polls: 0,
            messages: 0,
        }
    }

    #[must_use]
    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.host, self.port)
    }

    /// Most recent time anything happened for this target.
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_poll_attempt.max(self.last_contact)
    }

    fn is_stale(&self, now: DateTime<Utc>, max_silence: Duration) -> bool {
        if self.period_minutes == 0 {
            return false;
        }
        match self.last_activity() {
            Some(t) => now - t >= max_silence,
            None => false,
        }
    }
}

/// Result of one poll (or one continuous connection cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    pub success: bool,
    pub messages: u64,
}

/// All [SourceStatus] records, guarded by a single lock.
#[derive(Debug, Default)]
pub struct StatusTable {
    inner: Mutex<HashMap<TargetKey, SourceStatus>>,
}

impl StatusTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetKey, SourceStatus>> {
        // A worker that panicked mid-update leaves at worst a stale counter.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Load a checkpoint written by [Self::checkpoint]. A missing file yields an
    /// empty table.
    ///
    /// # Errors
    /// If the file exists but cannot be read or decoded.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(?path, "no status checkpoint, starting empty");
            return Ok(Self::default());
        }
        let records: Vec<SourceStatus> = serde_json::from_str(&fs::read_to_string(path)?)?;
        info!(?path, count = records.len(), "loaded status checkpoint");
        Ok(StatusTable {
            inner: Mutex::new(records.into_iter().map(|s| (s.key(), s)).collect()),
        })
    }

    /// Create the record for `cfg` or refresh its name and period.
    pub fn upsert(&self, cfg: &TargetConfig) {
        let mut table = self.lock();
        let status = table
            .entry(TargetKey::from(cfg))
            .or_insert_with(|| SourceStatus::new(cfg));
        status.name.clone_from(&cfg.name);
        status.period_minutes = cfg.period_minutes;
    }

    #[must_use]
    pub fn get(&self, key: &TargetKey) -> Option<SourceStatus> {
        self.lock().get(key).cloned()
    }

    pub fn record_attempt(&self, key: &TargetKey, now: DateTime<Utc>) {
        if let Some(status) = self.lock().get_mut(key) {
            status.last_poll_attempt = Some(now);
        }
    }

    /// Count a completed poll and the messages it produced.
    pub fn record_poll(&self, key: &TargetKey, result: PollResult, now: DateTime<Utc>) {
        if let Some(status) = self.lock().get_mut(key) {
            if result.success {
                status.good_polls += 1;
            } else {
                status.failed_polls += 1;
            }
            status.messages += result.messages;
            if result.messages > 0 {
                status.last_contact = Some(now);
            }
        }
    }

    /// Count messages from a continuously connected target.
    pub fn record_contact(&self, key: &TargetKey, messages: u64, now: DateTime<Utc>) {
        if let Some(status) = self.lock().get_mut(key) {
            status.messages += messages;
            status.last_contact = Some(now);
        }
    }

    /// All records, ordered by host and port.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SourceStatus> {
        let mut records: Vec<SourceStatus> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        records
    }

    /// Remove polled-target records with no activity for `max_silence`. Returns the
    /// number removed.
    pub fn prune(&self, now: DateTime<Utc>, max_silence: Duration) -> usize {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|key, status| {
            let stale = status.is_stale(now, max_silence);
            if stale {
                debug!(target = %key, "pruning stale status");
            }
            !stale
        });
        before - table.len()
    }

    /// Prune, then write all records to `path`. The file is replaced atomically.
    /// Returns the number of records pruned.
    ///
    /// # Errors
    /// If the file cannot be written.
    pub fn checkpoint(&self, path: &Path, now: DateTime<Utc>, max_silence: Duration) -> Result<usize> {
        let pruned = self.prune(now, max_silence);
        let records = self.snapshot();
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, &records)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(?path, count = records.len(), pruned, "wrote status checkpoint");
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn poll_results_are_counted() {
        let table = StatusTable::new();
        let cfg = TargetConfig::new("h", 1, "one", 5);
        let key = TargetKey::from(&cfg);
        table.upsert(&cfg);

        table.record_attempt(&key, t(1));
        table.record_poll(&key, PollResult { success: true, messages: 3 }, t(1));
        table.record_poll(&key, PollResult { success: false, messages: 0 }, t(2));

        let status = table.get(&key).unwrap();
        assert_eq!(status.good_polls, 1);
        assert_eq!(status.failed_polls, 1);
        assert_eq!(status.messages, 3);
        assert_eq!(status.last_poll_attempt, Some(t(1)));
        assert_eq!(status.last_contact, Some(t(1)));
    }

    #[test]
    fn upsert_refreshes_period() {
        let table = StatusTable::new();
        table.upsert(&TargetConfig::new("h", 1, "one", 5));
        table.upsert(&TargetConfig::new("h", 1, "uno", 10));

        let status = table.get(&TargetKey::new("h", 1)).unwrap();
        assert_eq!(status.name, "uno");
        assert_eq!(status.period_minutes, 10);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn prune_only_touches_silent_polled_targets() {
        let table = StatusTable::new();
        for (host, period) in [("old", 5), ("recent", 5), ("continuous", 0), ("never", 5)] {
            table.upsert(&TargetConfig::new(host, 1, host, period));
        }
        table.record_attempt(&TargetKey::new("old", 1), t(1));
        table.record_attempt(&TargetKey::new("recent", 1), t(20));
        table.record_contact(&TargetKey::new("continuous", 1), 1, t(1));

        let pruned = table.prune(t(31) + Duration::hours(1), Duration::days(30));

        assert_eq!(pruned, 1);
        assert!(table.get(&TargetKey::new("old", 1)).is_none());
        assert_eq!(table.snapshot().len(), 3);
    }

    #[test]
    fn checkpoint_reloads_and_drops_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let table = StatusTable::new();
        for (host, period) in [("old", 5), ("recent", 5), ("continuous", 0)] {
            table.upsert(&TargetConfig::new(host, 1, host, period));
        }
        let recent = TargetKey::new("recent", 1);
        table.record_attempt(&TargetKey::new("old", 1), t(1));
        table.record_attempt(&recent, t(20));
        table.record_poll(&recent, PollResult { success: true, messages: 2 }, t(20));
        table.record_poll(&recent, PollResult { success: false, messages: 0 }, t(21));
        table.record_contact(&TargetKey::new("continuous", 1), 4, t(1));

        let pruned = table
            .checkpoint(&path, t(31) + Duration::hours(1), Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(!path.with_extension("tmp").exists());

        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains("\"old\""), "{written}");

        let loaded = StatusTable::load(&path).unwrap();
        assert_eq!(loaded.snapshot(), table.snapshot());
        let status = loaded.get(&recent).unwrap();
        assert_eq!(status.good_polls, 1);
        assert_eq!(status.failed_polls, 1);
        assert_eq!(status.messages, 2);
        assert_eq!(status.last_poll_attempt, Some(t(20)));
        assert!(loaded.get(&TargetKey::new("old", 1)).is_none());
    }

    #[test]
    fn missing_checkpoint_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::load(&dir.path().join("absent.json")).unwrap();
        assert!(table.snapshot().is_empty());
    }
}
