use std::time::{Duration, SystemTime};

use crate::directory::Peer;
use crate::error::ProbeError;

/// Kind of probe performed against a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Ping,
    Download,
}

impl ProbeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Download => "download",
        }
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurement of a successful download probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSample {
    pub duration: Duration,
    pub payload_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Success {
        duration: Duration,
        /// Only set for download probes
        payload_bytes: Option<u64>,
    },
    Failure(ProbeError),
}

/// Result of one probe attempt, consumed immediately by the metrics aggregator
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Identity of the probed peer
    pub peer: String,

    /// Zone of the probed peer at the time of the probe
    pub zone: String,

    pub kind: ProbeKind,

    /// When the probe finished
    pub timestamp: SystemTime,

    pub status: ProbeStatus,
}

impl ProbeStatus {
    /// Successful ping taking `duration`
    pub fn pinged(duration: Duration) -> Self {
        ProbeStatus::Success { duration, payload_bytes: None }
    }
}

impl From<DownloadSample> for ProbeStatus {
    fn from(sample: DownloadSample) -> Self {
        ProbeStatus::Success { duration: sample.duration, payload_bytes: Some(sample.payload_bytes) }
    }
}

impl From<ProbeError> for ProbeStatus {
    fn from(error: ProbeError) -> Self {
        ProbeStatus::Failure(error)
    }
}

impl ProbeOutcome {
    /// Outcome of a finished probe against `peer`, stamped now
    pub fn new(peer: &Peer, kind: ProbeKind, status: impl Into<ProbeStatus>) -> Self {
        Self {
            peer: peer.name.clone(),
            zone: peer.zone.clone(),
            kind,
            timestamp: SystemTime::now(),
            status: status.into(),
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ProbeStatus::Success { .. })
    }

    #[cfg(test)]
    pub fn error(&self) -> Option<&ProbeError> {
        match &self.status {
            ProbeStatus::Failure(error) => Some(error),
            ProbeStatus::Success { .. } => None,
        }
    }
}
