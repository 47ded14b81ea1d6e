//! Daemon configuration and the poll-target list.
//!
//! Both are JSON. The poll-target list is re-read on an interval, so each record is
//! decoded on its own and a bad record is skipped without failing the reload.
use std::{
    collections::HashSet,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::prelude::*;

/// One record of the poll-target list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    /// Display name
    pub name: String,
    /// Minutes between polls. Zero means the DCP is kept connected continuously.
    #[serde(alias = "polling_period")]
    pub period_minutes: u32,
}

impl TargetConfig {
    pub fn new(host: &str, port: u16, name: &str, period_minutes: u32) -> Self {
        TargetConfig {
            host: host.to_string(),
            port,
            name: name.to_string(),
            period_minutes,
        }
    }

    #[must_use]
    pub fn is_continuous(&self) -> bool {
        self.period_minutes == 0
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config(format!("{}: empty host", self.name)));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("{}: port 0", self.name)));
        }
        Ok(())
    }
}

/// Decode a poll-target list, skipping (and logging) malformed or duplicate records.
///
/// # Errors
/// If `dat` is not a JSON array.
pub fn parse_targets(dat: &str) -> Result<Vec<TargetConfig>> {
    let records: Vec<serde_json::Value> = serde_json::from_str(dat)?;
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let target: TargetConfig = match serde_json::from_value(record) {
            Ok(t) => t,
            Err(err) => {
                warn!(index = idx, "skipping malformed poll target: {err}");
                continue;
            }
        };
        if let Err(err) = target.validate() {
            warn!(index = idx, "skipping poll target: {err}");
            continue;
        }
        if !seen.insert((target.host.clone(), target.port)) {
            warn!(
                index = idx,
                host = %target.host,
                port = target.port,
                "skipping duplicate poll target"
            );
            continue;
        }
        targets.push(target);
    }
    Ok(targets)
}

/// Read and decode a poll-target list file. See [parse_targets].
///
/// # Errors
/// If the file cannot be read or is not a JSON array.
pub fn load_targets(path: &Path) -> Result<Vec<TargetConfig>> {
    parse_targets(&fs::read_to_string(path)?)
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Where the command writes archived messages.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Poll status checkpoint file.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
    #[serde(default)]
    pub netdcp: Option<NetDcpConfig>,
    #[serde(default)]
    pub sbd: Option<SbdConfig>,
    #[serde(default)]
    pub downlink: Option<DownlinkConfig>,
}

impl IngestConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    /// If the file cannot be read or decoded.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

/// Polled and continuous network DCP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetDcpConfig {
    /// JSON list of [TargetConfig]s, re-read every `reload_interval_secs`.
    pub targets_file: PathBuf,
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Polled messages with a transmit time older than this are not archived.
    #[serde(default = "default_max_msg_age")]
    pub max_msg_age_hours: u64,
    /// How long a dropped target is kept for workers still holding it.
    #[serde(default = "default_dead_grace")]
    pub dead_grace_secs: u64,
    /// Status of polled targets not heard from in this long is pruned.
    #[serde(default = "default_prune_after")]
    pub prune_after_days: u64,
}

impl NetDcpConfig {
    pub fn new(targets_file: PathBuf) -> Self {
        NetDcpConfig {
            targets_file,
            reload_interval_secs: default_reload_interval(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_msg_age_hours: default_max_msg_age(),
            dead_grace_secs: default_dead_grace(),
            prune_after_days: default_prune_after(),
        }
    }

    #[must_use]
    pub fn max_msg_age(&self) -> Duration {
        Duration::from_secs(self.max_msg_age_hours * 3600)
    }

    #[must_use]
    pub fn prune_after(&self) -> chrono::Duration {
        i64::try_from(self.prune_after_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Iridium SBD listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbdConfig {
    #[serde(default = "default_sbd_listen")]
    pub listen_addr: String,
    #[serde(default = "default_idle_timeout")]
    pub read_timeout_secs: u64,
}

impl SbdConfig {
    /// Parsed [Self::listen_addr].
    ///
    /// # Errors
    /// If the address does not parse.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|err| Error::Config(format!("sbd listen_addr {}: {err}", self.listen_addr)))
    }
}

impl Default for SbdConfig {
    fn default() -> Self {
        SbdConfig {
            listen_addr: default_sbd_listen(),
            read_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Where downlink bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DownlinkBackend {
    /// Protocol converter relaying the serial stream over TCP.
    Tcp { host: String, port: u16 },
    /// Receiver card exposed as a character device.
    Device { path: PathBuf },
}

/// Satellite downlink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownlinkConfig {
    pub backend: DownlinkBackend,
    /// Silence longer than this puts the link in timeout.
    #[serde(default = "default_downlink_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Archive abnormal received message (ARM) reports too.
    #[serde(default)]
    pub accept_arms: bool,
}

impl DownlinkConfig {
    pub fn new(backend: DownlinkBackend) -> Self {
        DownlinkConfig {
            backend,
            timeout_secs: default_downlink_timeout(),
            buffer_capacity: default_buffer_capacity(),
            accept_arms: false,
        }
    }
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archive")
}
fn default_checkpoint_interval() -> u64 {
    60
}
fn default_reload_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    20
}
fn default_connect_timeout() -> u64 {
    20
}
fn default_reconnect_delay() -> u64 {
    60
}
fn default_max_msg_age() -> u64 {
    48
}
fn default_dead_grace() -> u64 {
    60
}
fn default_prune_after() -> u64 {
    30
}
fn default_sbd_listen() -> String {
    "0.0.0.0:10800".to_string()
}
fn default_downlink_timeout() -> u64 {
    60
}
fn default_buffer_capacity() -> usize {
    16_000
}
