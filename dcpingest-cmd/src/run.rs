use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam::channel::RecvTimeoutError;
use dcpingest::{
    archive::{ArchiveSink, ChannelSink},
    config::{IngestConfig, NetDcpConfig},
    downlink::{backend, DownlinkRecv},
    polling::NetDcpRecv,
    sbd::SbdListener,
    source::InputSource,
    status::StatusTable,
};
use tracing::{error, info, warn};

use crate::archive::DailyArchive;

const TICK: Duration = Duration::from_secs(1);
const DEFAULT_PRUNE_DAYS: i64 = 30;

fn checkpoint(status: &StatusTable, path: Option<&Path>, prune_after: chrono::Duration) {
    let Some(path) = path else {
        return;
    };
    match status.checkpoint(path, Utc::now(), prune_after) {
        Ok(pruned) => info!(?path, pruned, "status checkpointed"),
        Err(err) => error!(?path, "status checkpoint failed: {err}"),
    }
}

fn log_status(inputs: &[&dyn InputSource]) {
    for input in inputs {
        info!(source = %input.source_id(), "{}", input.status());
    }
}

pub fn run(config_path: &Path, run_for: Option<Duration>) -> Result<()> {
    let cfg = IngestConfig::load(config_path)
        .with_context(|| format!("loading config {config_path:?}"))?;
    let status = Arc::new(match &cfg.status_file {
        Some(path) => {
            StatusTable::load(path).with_context(|| format!("loading status {path:?}"))?
        }
        None => StatusTable::new(),
    });
    let prune_after = cfg.netdcp.as_ref().map_or_else(
        || chrono::Duration::days(DEFAULT_PRUNE_DAYS),
        NetDcpConfig::prune_after,
    );
    let mut archive = DailyArchive::new(&cfg.archive_dir)?;

    let (sink, messages) = ChannelSink::new();
    let sink: Arc<dyn ArchiveSink> = Arc::new(sink);
    let netdcp = cfg
        .netdcp
        .clone()
        .map(|c| NetDcpRecv::new(c, Arc::clone(&status), Arc::clone(&sink)));
    let sbd = cfg
        .sbd
        .clone()
        .map(|c| SbdListener::new(c, Arc::clone(&sink)));
    let downlink = cfg.downlink.clone().map(|c| {
        let transport = backend(&c);
        DownlinkRecv::new(c, transport, Arc::clone(&sink))
    });
    drop(sink);

    let mut inputs: Vec<&dyn InputSource> = Vec::new();
    if let Some(netdcp) = &netdcp {
        netdcp.start().context("starting network DCP inputs")?;
        inputs.extend(netdcp.inputs());
    }
    if let Some(sbd) = &sbd {
        inputs.push(sbd);
    }
    if let Some(downlink) = &downlink {
        inputs.push(downlink);
    }
    if inputs.is_empty() {
        warn!("no inputs configured");
    }
    // a failed input stays failed, the others keep running
    for input in sbd
        .iter()
        .map(|s| s as &dyn InputSource)
        .chain(downlink.iter().map(|d| d as &dyn InputSource))
    {
        if let Err(err) = input.enable(true) {
            error!(source = %input.source_id(), "failed to start: {err}");
        }
    }

    let started = Instant::now();
    let mut next_checkpoint = started + cfg.checkpoint_interval();
    loop {
        match messages.recv_timeout(TICK) {
            Ok(msg) => {
                if let Err(err) = archive.write(&msg) {
                    error!("dropping {msg}: {err:#}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if Instant::now() >= next_checkpoint {
            checkpoint(&status, cfg.status_file.as_deref(), prune_after);
            log_status(&inputs);
            next_checkpoint = Instant::now() + cfg.checkpoint_interval();
        }
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            info!("run time elapsed");
            break;
        }
    }

    info!("shutting down");
    if let Some(netdcp) = &netdcp {
        netdcp.shutdown();
    }
    if let Some(sbd) = &sbd {
        sbd.shutdown();
    }
    if let Some(downlink) = &downlink {
        downlink.shutdown();
    }
    for msg in messages.try_iter() {
        if let Err(err) = archive.write(&msg) {
            error!("dropping {msg}: {err:#}");
        }
    }
    archive.flush()?;
    checkpoint(&status, cfg.status_file.as_deref(), prune_after);
    log_status(&inputs);
    info!(messages = archive.written(), "done");

    Ok(())
}
