//! The contract every input honors.
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::archive::Archiver;
use crate::message::DcpMsg;
use crate::prelude::*;

/// The input variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Network DCPs connected to on a schedule.
    Polled,
    /// Network DCPs kept connected at all times.
    Continuous,
    /// Iridium Short-Burst-Data gateway connections.
    Sbd,
    /// Synchronous satellite downlink byte stream.
    Downlink,
}

/// Stable identifier of an input, stamped on each message it archives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub kind: SourceKind,
    pub name: String,
}

impl SourceId {
    pub fn new(kind: SourceKind, name: impl Into<String>) -> Self {
        SourceId {
            kind,
            name: name.into(),
        }
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.name)
    }
}

/// A source of DCP messages.
///
/// `enable(true)` may be called repeatedly, including after `enable(false)`, and must
/// not block for longer than it takes to set up a connection. Messages leave an input
/// only through [InputSource::archive].
pub trait InputSource: Send + Sync {
    /// Start or stop producing messages.
    ///
    /// # Errors
    /// If the input cannot be started, e.g., a listener cannot bind its port. Such
    /// failures are reflected in [InputSource::status] and are not retried.
    fn enable(&self, enabled: bool) -> Result<()>;

    /// Operator-visible status.
    fn status(&self) -> String;

    fn source_id(&self) -> SourceId;

    fn archiver(&self) -> &Archiver;

    /// Stamp `msg` with this input's identifier and hand it to the archive.
    fn archive(&self, msg: DcpMsg) {
        self.archiver().archive(msg);
    }

    /// Stop for good and release all resources.
    fn shutdown(&self) {
        if let Err(err) = self.enable(false) {
            tracing::warn!(source = %self.source_id(), "disable on shutdown failed: {err}");
        }
    }
}
