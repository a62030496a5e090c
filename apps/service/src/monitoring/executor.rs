use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::checker::Prober;
use super::types::{DownloadSample, ProbeKind, ProbeOutcome, ProbeStatus};
use crate::directory::Peer;
use crate::error::ProbeError;

/// Probe executor - runs individual probes under a hard deadline.
///
/// The deadline is enforced here, independently of whatever the underlying
/// prober does, so a hung peer can never hold a scheduler longer than `timeout`.
pub struct ProbeExecutor {
    prober: Arc<dyn Prober>,
    timeout: Duration,
}

impl ProbeExecutor {
    pub fn new(prober: Arc<dyn Prober>, timeout: Duration) -> Self {
        Self { prober, timeout }
    }

    pub async fn ping_probe(&self, peer: &Peer) -> Result<Duration, ProbeError> {
        timeout(self.timeout, self.prober.ping(peer))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }

    pub async fn download_probe(&self, peer: &Peer) -> Result<DownloadSample, ProbeError> {
        timeout(self.timeout, self.prober.download(peer))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }

    /// Execute one probe and turn it into an outcome
    pub async fn execute(&self, kind: ProbeKind, peer: &Peer) -> ProbeOutcome {
        let status = match kind {
            ProbeKind::Ping => match self.ping_probe(peer).await {
                Ok(latency) => ProbeStatus::pinged(latency),
                Err(e) => ProbeStatus::Failure(e),
            },
            ProbeKind::Download => match self.download_probe(peer).await {
                Ok(sample) => ProbeStatus::from(sample),
                Err(e) => ProbeStatus::Failure(e),
            },
        };

        ProbeOutcome::new(peer, kind, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::testing::{Behavior, ScriptedProber, peer};

    #[tokio::test]
    async fn test_successful_probes() {
        let prober = Arc::new(ScriptedProber::new());
        let executor = ProbeExecutor::new(prober.clone(), Duration::from_secs(1));
        let target = peer("a", 1, "x");

        let ping = executor.execute(ProbeKind::Ping, &target).await;
        assert!(ping.is_success());

        let download = executor.execute(ProbeKind::Download, &target).await;
        assert!(matches!(download.status, ProbeStatus::Success { payload_bytes: Some(_), .. }));
        assert_eq!(prober.calls("a", ProbeKind::Ping), 1);
        assert_eq!(prober.calls("a", ProbeKind::Download), 1);
    }

    #[tokio::test]
    async fn test_prober_error_is_passed_through() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("a", ProbeKind::Download, Behavior::Fail(ProbeError::Unreachable("refused".into())));
        let executor = ProbeExecutor::new(prober, Duration::from_secs(1));

        let outcome = executor.execute(ProbeKind::Download, &peer("a", 1, "x")).await;
        assert_eq!(outcome.error(), Some(&ProbeError::Unreachable("refused".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_prober_is_cut_at_deadline() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set("a", ProbeKind::Ping, Behavior::Hang);
        let executor = ProbeExecutor::new(prober, Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        let outcome = executor.execute(ProbeKind::Ping, &peer("a", 1, "x")).await;
        assert_eq!(outcome.error(), Some(&ProbeError::Timeout(Duration::from_secs(2))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
    }
}
