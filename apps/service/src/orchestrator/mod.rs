/// Orchestrator module - glues the directory, schedulers and metrics together
///
/// The coordinator is the single owner of the set of live peer schedulers:
/// - Refreshes the peer directory on a fixed interval
/// - Diffs each fresh snapshot against the one it last applied
/// - Starts, stops or retargets schedulers accordingly
/// - Evicts series no peer reports into anymore when the retention policy asks for it
///
/// Nothing else mutates the scheduler set, so no locking is needed around it.


use std::collections::HashMap;
use std::time::Duration;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::config::RetentionPolicy;
use crate::directory::{Peer, PeerDirectory, Snapshot, SnapshotDiff, diff};
use crate::metrics::MetricsAggregator;
use crate::monitoring::{ProbeScheduler, SchedulerHandle};

/// A removed peer whose scheduler may still be finishing its last tick
struct Draining {
    peer: Peer,
    task: JoinHandle<()>,
}

/// Previous target of a live scheduler, in use until that scheduler has completed `until_ticks`
struct Retired {
    peer: Peer,
    until_ticks: u64,
}

pub struct Coordinator {
    directory: PeerDirectory,
    scheduler: ProbeScheduler,
    aggregator: Arc<MetricsAggregator>,
    refresh_interval: Duration,
    shutdown_grace: Duration,
    /// Snapshot the scheduler set currently reflects
    applied: Snapshot,
    schedulers: HashMap<String, SchedulerHandle>,
    draining: Vec<Draining>,
    /// Only tracked under the evict policy
    retired: Vec<Retired>,
}

impl Coordinator {
    pub fn new(
        directory: PeerDirectory,
        scheduler: ProbeScheduler,
        aggregator: Arc<MetricsAggregator>,
        refresh_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            directory,
            scheduler,
            aggregator,
            refresh_interval,
            shutdown_grace,
            applied: Snapshot::empty(),
            schedulers: HashMap::new(),
            draining: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Run refresh cycles until `shutdown` flips to true (or its sender is dropped),
    /// then stop every scheduler.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.refresh_interval.as_secs(), "Starting peer coordinator");

        let mut timer = interval(self.refresh_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = timer.tick() => {
                    self.refresh_once().await;
                }
            }
        }

        self.shutdown().await;
    }

    /// One refresh cycle, returning the applied changes.
    ///
    /// A discovery failure is logged and counted and yields `None`; the schedulers
    /// keep probing the last known peers.
    pub async fn refresh_once(&mut self) -> Option<SnapshotDiff> {
        self.reap();

        match self.directory.refresh().await {
            Ok(snapshot) => {
                let changes = self.apply(snapshot);
                if !changes.is_empty() {
                    info!(
                        added = changes.added.len(),
                        removed = changes.removed.len(),
                        changed = changes.changed.len(),
                        peers = self.applied.len(),
                        "Peer set updated"
                    );
                }
                Some(changes)
            }
            Err(e) => {
                self.aggregator.discovery_failed();
                let last_good = self.directory.snapshot();
                let age_s = last_good.captured_at().elapsed().map(|age| age.as_secs()).unwrap_or_default();
                warn!(
                    peers = last_good.len(),
                    age_s,
                    "Peer directory refresh failed, keeping last known peers: {}", e
                );
                None
            }
        }
    }

    /// Reconcile schedulers with `next` and make it the applied snapshot
    pub fn apply(&mut self, next: Snapshot) -> SnapshotDiff {
        let changes = diff(&self.applied, &next);

        for name in &changes.removed {
            if let Some(handle) = self.schedulers.remove(name) {
                let peer = handle.target();
                info!(peer = %peer, "Stopping peer scheduler");
                self.draining.push(Draining { peer, task: handle.stop() });
            }
        }

        for peer in &changes.changed {
            if let Some(handle) = self.schedulers.get(&peer.name) {
                info!(peer = %peer, "Retargeting peer scheduler");
                let previous = handle.target();
                let until_ticks = handle.retarget(peer.clone());
                self.retire(previous, peer, until_ticks);
            }
        }

        for peer in &changes.added {
            // Removed earlier and back before its last tick finished
            let predecessor = self
                .draining
                .iter()
                .position(|draining| draining.peer.name == peer.name)
                .map(|index| self.draining.swap_remove(index));

            let handle = match predecessor {
                Some(Draining { peer: previous, task }) => {
                    info!(peer = %peer, "Restarting peer scheduler after its previous run drains");
                    // Any completed tick of the new scheduler means the previous run is over
                    self.retire(previous, peer, 1);
                    self.scheduler.schedule_peer_after(peer.clone(), Some(task))
                }
                None => {
                    info!(peer = %peer, "Starting peer scheduler");
                    self.scheduler.schedule_peer(peer.clone())
                }
            };
            self.schedulers.insert(peer.name.clone(), handle);
        }

        self.aggregator.set_known_peers(next.len());
        self.applied = next;
        changes
    }

    /// Remember `previous` for eviction if its series label differs from `next`'s
    fn retire(&mut self, previous: Peer, next: &Peer, until_ticks: u64) {
        if self.aggregator.retention() != RetentionPolicy::Evict
            || self.aggregator.series_label(&previous) == self.aggregator.series_label(next)
        {
            return;
        }
        self.retired.push(Retired { peer: previous, until_ticks });
    }

    /// Whether no scheduler can still report into `retired`'s series
    fn is_released(&self, retired: &Retired) -> bool {
        match self.schedulers.get(&retired.peer.name) {
            Some(handle) => handle.completed_ticks() >= retired.until_ticks,
            None => !self.draining.iter().any(|draining| draining.peer.name == retired.peer.name),
        }
    }

    /// Forget drained schedulers and finished retargets, evicting their series if
    /// nobody else reports into them
    fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.draining.drain(..).partition(|draining| draining.task.is_finished());
        self.draining = pending;

        let mut released: Vec<Peer> = done.into_iter().map(|draining| draining.peer).collect();
        let (finished, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.retired).into_iter().partition(|retired| self.is_released(retired));
        self.retired = waiting;
        released.extend(finished.into_iter().map(|retired| retired.peer));

        if self.aggregator.retention() != RetentionPolicy::Evict {
            return;
        }

        for peer in released {
            let label = self.aggregator.series_label(&peer);
            let still_reported = self.applied.peers().any(|live| self.aggregator.series_label(live) == label);
            if still_reported {
                debug!(peer = %peer, label, "Series still in use, not evicting");
            } else {
                info!(peer = %peer, label, "Evicting series of departed peer");
                self.aggregator.evict(&peer);
            }
        }
    }

    /// Stop every scheduler and wait for in-flight ticks, bounded by the grace window
    pub async fn shutdown(mut self) {
        info!(schedulers = self.schedulers.len(), "Stopping peer schedulers");

        let mut tasks: Vec<JoinHandle<()>> =
            self.schedulers.drain().map(|(_, handle)| handle.stop()).collect();
        tasks.extend(self.draining.drain(..).map(|draining| draining.task));

        if timeout(self.shutdown_grace, join_all(tasks)).await.is_err() {
            warn!(grace_s = self.shutdown_grace.as_secs(), "Peer schedulers did not drain in time");
        } else {
            info!("Peer coordinator stopped");
        }
    }

    #[cfg(test)]
    pub fn applied(&self) -> &Snapshot {
        &self.applied
    }

    /// Identities that currently have a live scheduler, sorted
    #[cfg(test)]
    pub fn scheduled_peers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.schedulers.keys().cloned().collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub fn scheduled_target(&self, name: &str) -> Option<Peer> {
        self.schedulers.get(name).map(SchedulerHandle::target)
    }

    #[cfg(test)]
    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }
}
