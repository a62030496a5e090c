use std::io::Error as IoError;
use std::time::Duration;

use thiserror::Error;

/// Failure to obtain a consistent peer set from the membership source.
///
/// Never fatal: the directory keeps its last-known-good snapshot and the
/// next refresh cycle retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("membership source unreachable: {0}")]
    Unreachable(String),
    #[error("malformed membership answer: {0}")]
    Malformed(String),
    #[error("membership query timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of a single ping or download probe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("probe cancelled")]
    Cancelled,
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

impl ProbeError {
    /// Stable value for the `reason` label of the failure counter.
    pub fn reason(&self) -> &'static str {
        match self {
            ProbeError::Unreachable(_) => "unreachable",
            ProbeError::Protocol(_) => "protocol_error",
            ProbeError::Cancelled => "cancelled",
            ProbeError::Timeout(_) => "timeout",
        }
    }

    pub const REASONS: [&'static str; 4] = ["unreachable", "protocol_error", "cancelled", "timeout"];
}

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: String, source: IoError },
    #[error("failed to write config {path}: {source}")]
    Write { path: String, source: IoError },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors that make it impossible to start probing with an unambiguous identity.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{0} env var is required")]
    MissingEnv(&'static str),
    #[error("node {0} carries no zone label")]
    MissingZone(String),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
