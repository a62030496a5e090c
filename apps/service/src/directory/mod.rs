//! Peer directory - the eventually-consistent view of the probed cohort.
//!
//! The directory owns the last-known-good [`Snapshot`] and refreshes it from a
//! [`MembershipSource`]. A failed refresh never clobbers the previous snapshot,
//! so probing continues against stale-but-valid membership.

pub mod kubernetes;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::timeout;
use tracing::debug;

use crate::error::DiscoveryError;

pub use self::kubernetes::KubeMembership;

/// Zone reported for peers whose node carries no zone label
pub const UNKNOWN_ZONE: &str = "unknown";

/// One probe target, as of the last refresh
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Stable identity (pod name)
    pub name: String,
    pub address: SocketAddr,
    pub zone: String,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: SocketAddr, zone: impl Into<String>) -> Self {
        Self { name: name.into(), address, zone: zone.into() }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.address, self.zone)
    }
}

/// Immutable point-in-time view of cohort membership, keyed by identity
#[derive(Debug, Clone)]
pub struct Snapshot {
    peers: BTreeMap<String, Peer>,
    captured_at: SystemTime,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self { peers: BTreeMap::new(), captured_at: SystemTime::now() }
    }

    /// Build a snapshot from a full membership answer.
    ///
    /// Two peers sharing an identity is not a consistent peer set.
    pub fn from_peers(peers: impl IntoIterator<Item = Peer>) -> Result<Self, DiscoveryError> {
        let mut by_name = BTreeMap::new();
        for peer in peers {
            if let Some(previous) = by_name.insert(peer.name.clone(), peer) {
                return Err(DiscoveryError::Malformed(format!(
                    "duplicate peer identity {}",
                    previous.name
                )));
            }
        }
        Ok(Self { peers: by_name, captured_at: SystemTime::now() })
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Membership change between two snapshots. Every list is sorted by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<Peer>,
    pub removed: Vec<String>,
    /// Same identity, new address or zone
    pub changed: Vec<Peer>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare two snapshots by identity. Pure and independent of capture order.
pub fn diff(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let mut result = SnapshotDiff::default();

    for (name, peer) in &new.peers {
        match old.peers.get(name) {
            None => result.added.push(peer.clone()),
            Some(previous) if previous != peer => result.changed.push(peer.clone()),
            Some(_) => {}
        }
    }
    result.removed =
        old.peers.keys().filter(|name| !new.peers.contains_key(*name)).cloned().collect();

    result
}

/// Source of cohort membership
#[async_trait::async_trait]
pub trait MembershipSource: Send + Sync {
    /// Return the complete current peer set, or an error. Never a partial answer.
    async fn list_peers(&self) -> Result<Vec<Peer>, DiscoveryError>;
}

/// Holds the last-known-good snapshot and refreshes it from a membership source
pub struct PeerDirectory {
    source: Arc<dyn MembershipSource>,
    current: Snapshot,
    query_timeout: Duration,
}

impl PeerDirectory {
    pub fn new(source: Arc<dyn MembershipSource>, query_timeout: Duration) -> Self {
        Self { source, current: Snapshot::empty(), query_timeout }
    }

    /// Query the membership source once.
    ///
    /// On success the returned snapshot becomes the current one. On failure the
    /// current snapshot is left untouched.
    pub async fn refresh(&mut self) -> Result<Snapshot, DiscoveryError> {
        let peers = timeout(self.query_timeout, self.source.list_peers())
            .await
            .map_err(|_| DiscoveryError::Timeout(self.query_timeout))??;

        let snapshot = Snapshot::from_peers(peers)?;
        debug!(peers = snapshot.len(), "Directory refreshed");
        self.current = snapshot.clone();
        Ok(snapshot)
    }

    /// Last-known-good snapshot
    pub fn snapshot(&self) -> &Snapshot {
        &self.current
    }
}
