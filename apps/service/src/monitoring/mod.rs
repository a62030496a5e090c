pub mod checker;
/// Probing engine module - measures latency to peers
///
/// This module is responsible for:
/// - Talking to peers over the network (ping and download probes)
/// - Enforcing the per-probe deadline
/// - Driving one independent probing cadence per peer
pub mod executor;
pub mod scheduler;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use checker::{HttpProber, Prober};
pub use executor::ProbeExecutor;
pub use scheduler::{ProbeScheduler, ScheduleConfig, SchedulerHandle};
pub use types::{ProbeKind, ProbeOutcome};
