use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info};

use super::executor::ProbeExecutor;
use super::types::ProbeKind;
use crate::directory::Peer;
use crate::metrics::MetricsAggregator;

/// Cadence settings shared by every peer scheduler
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// Upper bound of the random delay before a scheduler's first tick
    pub jitter_max: Duration,
}

/// Probe scheduler - spawns one independent probing task per peer
pub struct ProbeScheduler {
    executor: Arc<ProbeExecutor>,
    aggregator: Arc<MetricsAggregator>,
    config: ScheduleConfig,
}

/// Ticks a scheduler task has started and completed
#[derive(Debug, Default)]
struct TickCounters {
    started: AtomicU64,
    completed: AtomicU64,
}

/// Control side of one peer's probing task.
///
/// Dropping the handle without calling [`SchedulerHandle::stop`] also stops the
/// task after its current tick.
pub struct SchedulerHandle {
    target_tx: watch::Sender<Peer>,
    stop_tx: watch::Sender<bool>,
    ticks: Arc<TickCounters>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Probe `peer` from the next tick on. An in-flight tick keeps its old target.
    ///
    /// Returns how many ticks may still probe the previous target: once
    /// [`SchedulerHandle::completed_ticks`] reaches it, the previous target is done with.
    pub fn retarget(&self, peer: Peer) -> u64 {
        self.target_tx.send_replace(peer);
        self.ticks.started.load(Ordering::SeqCst)
    }

    /// Current target
    pub fn target(&self) -> Peer {
        self.target_tx.borrow().clone()
    }

    pub fn completed_ticks(&self) -> u64 {
        self.ticks.completed.load(Ordering::SeqCst)
    }

    /// Ask the task to stop once its current tick is done.
    ///
    /// The returned handle resolves after the last outcome has been recorded.
    pub fn stop(self) -> JoinHandle<()> {
        self.stop_tx.send_replace(true);
        self.task
    }
}

impl ProbeScheduler {
    pub fn new(
        executor: Arc<ProbeExecutor>,
        aggregator: Arc<MetricsAggregator>,
        config: ScheduleConfig,
    ) -> Self {
        Self { executor, aggregator, config }
    }

    /// Start periodic probing of `peer`
    pub fn schedule_peer(&self, peer: Peer) -> SchedulerHandle {
        self.schedule_peer_after(peer, None)
    }

    /// Start periodic probing of `peer` once `predecessor` has finished.
    ///
    /// `predecessor` is a stopped scheduler of the same peer that may still be in
    /// its last tick; waiting for it keeps ticks of one peer from overlapping.
    pub fn schedule_peer_after(&self, peer: Peer, predecessor: Option<JoinHandle<()>>) -> SchedulerHandle {
        let executor = self.executor.clone();
        let aggregator = self.aggregator.clone();
        let interval = self.config.interval;
        let jitter = start_jitter(self.config.jitter_max);

        let (target_tx, mut target_rx) = watch::channel(peer);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let ticks = Arc::new(TickCounters::default());
        let task_ticks = ticks.clone();

        let task = tokio::spawn(async move {
            let name = target_rx.borrow().name.clone();

            if let Some(previous) = predecessor {
                debug!(peer = %name, "Waiting for the previous scheduler of this peer to drain");
                // An error only means the previous task panicked; it is gone either way
                let _ = previous.await;
            }

            let first_tick = Instant::now() + jitter;
            debug!(peer = %name, jitter_ms = jitter.as_millis() as u64, "Peer scheduler waiting for first tick");

            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    info!(peer = %name, "Peer scheduler stopped before its first tick");
                    return;
                }
                _ = sleep_until(first_tick) => {}
            }

            let mut timer = interval_at(first_tick, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    // A dropped sender means the owner is gone: stop as well
                    _ = stop_rx.changed() => break,
                    _ = timer.tick() => {}
                }

                // Counted before reading the target so `retarget` can bound the ticks using the old one
                task_ticks.started.fetch_add(1, Ordering::SeqCst);
                let target = target_rx.borrow_and_update().clone();
                run_tick(&executor, &aggregator, &target).await;
                task_ticks.completed.fetch_add(1, Ordering::SeqCst);
            }

            info!(peer = %name, "Peer scheduler stopped");
        });

        SchedulerHandle { target_tx, stop_tx, ticks, task }
    }
}

/// Ping then download, each recorded as soon as it completes. Never retried.
async fn run_tick(executor: &ProbeExecutor, aggregator: &MetricsAggregator, peer: &Peer) {
    let ping = executor.execute(ProbeKind::Ping, peer).await;
    aggregator.record(&ping);

    let download = executor.execute(ProbeKind::Download, peer).await;
    aggregator.record(&download);
}

fn start_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}
