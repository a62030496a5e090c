//! Metrics aggregator - the only state shared by every peer scheduler.
//!
//! All series live in an owned prometheus [`Registry`]. Recording goes through
//! prometheus' atomic accumulators, so concurrent `record` calls from different
//! schedulers never need an external lock. Duration and size series only ever
//! see successful probes; failures land in a dedicated counter.

use std::collections::HashMap;
use std::time::Duration;

#[cfg(test)]
use prometheus::core::Collector;
#[cfg(test)]
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder, exponential_buckets,
};
use tracing::{debug, warn};

use crate::config::{LabelGranularity, RetentionPolicy};
use crate::directory::Peer;
use crate::error::ProbeError;
use crate::monitoring::types::{ProbeKind, ProbeOutcome, ProbeStatus};

pub const METRICS_PREFIX: &str = "cluster_latency";

/// Labels identifying this instance on every exported series
#[derive(Debug, Clone)]
pub struct SourceLabels {
    pub pod: String,
    pub zone: String,
}

pub struct MetricsAggregator {
    registry: Registry,
    granularity: LabelGranularity,
    retention: RetentionPolicy,
    ping_duration: HistogramVec,
    download_duration: HistogramVec,
    download_size: IntGaugeVec,
    download_throughput: GaugeVec,
    probe_failures: IntCounterVec,
    record_failures: IntCounter,
    discovery_failures: IntCounter,
    known_peers: IntGauge,
}

impl MetricsAggregator {
    pub fn new(
        source: &SourceLabels,
        granularity: LabelGranularity,
        retention: RetentionPolicy,
    ) -> Result<Self, prometheus::Error> {
        let const_labels = HashMap::from([
            ("source_pod".to_string(), source.pod.clone()),
            ("source_zone".to_string(), source.zone.clone()),
        ]);
        let registry = Registry::new_custom(Some(METRICS_PREFIX.to_string()), Some(const_labels))?;
        let label = granularity.label_name();

        let ping_duration = HistogramVec::new(
            HistogramOpts::new("ping_duration_seconds", "Duration of successful ping probes")
                .buckets(exponential_buckets(0.0001, 2.0, 16)?),
            &[label],
        )?;
        let download_duration = HistogramVec::new(
            HistogramOpts::new("download_duration_seconds", "Duration of successful download probes")
                .buckets(exponential_buckets(0.001, 2.0, 16)?),
            &[label],
        )?;
        let download_size = IntGaugeVec::new(
            Opts::new("download_probe_size_bytes", "Payload size of the last successful download probe"),
            &[label],
        )?;
        let download_throughput = GaugeVec::new(
            Opts::new(
                "download_throughput_bytes_per_second",
                "Throughput of the last successful download probe",
            ),
            &[label],
        )?;
        let probe_failures = IntCounterVec::new(
            Opts::new("probe_failures_total", "Failed probes by kind and reason"),
            &[label, "kind", "reason"],
        )?;
        let record_failures = IntCounter::new(
            "record_failures_total",
            "Probe outcomes that could not be mapped to a series",
        )?;
        let discovery_failures =
            IntCounter::new("discovery_failures_total", "Failed peer directory refreshes")?;
        let known_peers = IntGauge::new("known_peers", "Peers in the applied directory snapshot")?;

        registry.register(Box::new(ping_duration.clone()))?;
        registry.register(Box::new(download_duration.clone()))?;
        registry.register(Box::new(download_size.clone()))?;
        registry.register(Box::new(download_throughput.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(record_failures.clone()))?;
        registry.register(Box::new(discovery_failures.clone()))?;
        registry.register(Box::new(known_peers.clone()))?;

        Ok(Self {
            registry,
            granularity,
            retention,
            ping_duration,
            download_duration,
            download_size,
            download_throughput,
            probe_failures,
            record_failures,
            discovery_failures,
            known_peers,
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Label value of the series `peer` reports into
    pub fn series_label<'a>(&self, peer: &'a Peer) -> &'a str {
        self.label_for(&peer.name, &peer.zone)
    }

    fn label_for<'a>(&self, peer: &'a str, zone: &'a str) -> &'a str {
        match self.granularity {
            LabelGranularity::Peer => peer,
            LabelGranularity::Zone => zone,
        }
    }

    /// Record one probe outcome.
    ///
    /// An outcome that cannot be mapped to a series is counted in
    /// `record_failures_total` rather than dropped.
    pub fn record(&self, outcome: &ProbeOutcome) {
        if let Err(e) = self.try_record(outcome) {
            warn!(peer = %outcome.peer, kind = %outcome.kind, "Failed to record probe outcome: {}", e);
            self.record_failures.inc();
        }
    }

    fn try_record(&self, outcome: &ProbeOutcome) -> Result<(), prometheus::Error> {
        let label = self.label_for(&outcome.peer, &outcome.zone);

        match (&outcome.status, outcome.kind) {
            (ProbeStatus::Success { duration, .. }, ProbeKind::Ping) => {
                self.ping_duration.get_metric_with_label_values(&[label])?.observe(duration.as_secs_f64());
            }
            (ProbeStatus::Success { duration, payload_bytes }, ProbeKind::Download) => {
                let bytes = payload_bytes.unwrap_or_default();
                self.download_duration
                    .get_metric_with_label_values(&[label])?
                    .observe(duration.as_secs_f64());
                self.download_size
                    .get_metric_with_label_values(&[label])?
                    .set(i64::try_from(bytes).unwrap_or(i64::MAX));
                if let Some(rate) = throughput(bytes, *duration) {
                    self.download_throughput.get_metric_with_label_values(&[label])?.set(rate);
                }
            }
            (ProbeStatus::Failure(error), kind) => {
                debug!(peer = %outcome.peer, kind = %kind, "Probe failed: {}", error);
                self.probe_failures
                    .get_metric_with_label_values(&[label, kind.as_str(), error.reason()])?
                    .inc();
            }
        }

        Ok(())
    }

    /// Drop every series `peer` reports into
    pub fn evict(&self, peer: &Peer) {
        let label = self.series_label(peer);
        debug!(label, "Evicting series");

        // Series that were never written are missing; that is fine
        let _ = self.ping_duration.remove_label_values(&[label]);
        let _ = self.download_duration.remove_label_values(&[label]);
        let _ = self.download_size.remove_label_values(&[label]);
        let _ = self.download_throughput.remove_label_values(&[label]);
        for kind in [ProbeKind::Ping, ProbeKind::Download] {
            for reason in ProbeError::REASONS {
                let _ = self.probe_failures.remove_label_values(&[label, kind.as_str(), reason]);
            }
        }
    }

    pub fn discovery_failed(&self) {
        self.discovery_failures.inc();
    }

    pub fn set_known_peers(&self, count: usize) {
        self.known_peers.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Prometheus text exposition of every series
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Read-only views used by tests
#[cfg(test)]
impl MetricsAggregator {
    /// Successful observations plus failures recorded for `kind` under `label`.
    ///
    /// Reads through `collect` so that querying never creates a series.
    pub fn observation_count(&self, kind: ProbeKind, label: &str) -> u64 {
        let histogram = match kind {
            ProbeKind::Ping => &self.ping_duration,
            ProbeKind::Download => &self.download_duration,
        };
        let series = [(self.granularity.label_name(), label)];
        let successes: u64 = matching(&histogram.collect(), &series)
            .map(|metric| metric.get_histogram().get_sample_count())
            .sum();

        let failed = [(self.granularity.label_name(), label), ("kind", kind.as_str())];
        let failures: u64 = matching(&self.probe_failures.collect(), &failed)
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum();

        successes + failures
    }

    pub fn failure_count(&self, kind: ProbeKind, label: &str, reason: &str) -> u64 {
        let failed =
            [(self.granularity.label_name(), label), ("kind", kind.as_str()), ("reason", reason)];
        matching(&self.probe_failures.collect(), &failed)
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    pub fn record_failures(&self) -> u64 {
        self.record_failures.get()
    }

    pub fn discovery_failures(&self) -> u64 {
        self.discovery_failures.get()
    }

    pub fn known_peers(&self) -> i64 {
        self.known_peers.get()
    }
}

/// Metrics of `families` carrying every label pair in `labels`
#[cfg(test)]
fn matching<'a>(
    families: &'a [MetricFamily],
    labels: &'a [(&'a str, &'a str)],
) -> impl Iterator<Item = &'a Metric> + 'a {
    families.iter().flat_map(|family| family.get_metric()).filter(move |metric| {
        labels.iter().all(|(name, value)| {
            metric.get_label().iter().any(|pair| pair.get_name() == *name && pair.get_value() == *value)
        })
    })
}

fn throughput(bytes: u64, duration: Duration) -> Option<f64> {
    let seconds = duration.as_secs_f64();
    (seconds > 0.0).then(|| bytes as f64 / seconds)
}
