//! Kubernetes-backed membership: every running pod matching the cohort label selector.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

use super::{MembershipSource, Peer, UNKNOWN_ZONE};
use crate::error::DiscoveryError;

/// Zone labels in order of preference
pub const ZONE_LABELS: [&str; 2] =
    ["topology.kubernetes.io/zone", "failure-domain.beta.kubernetes.io/zone"];

/// Read the zone of a node from its labels
pub fn zone_from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<String> {
    let labels = labels?;
    ZONE_LABELS
        .iter()
        .find_map(|key| labels.get(*key).filter(|zone| !zone.is_empty()))
        .cloned()
}

pub struct KubeMembership {
    pods: Api<Pod>,
    nodes: Api<Node>,
    label_selector: String,
    own_pod: Option<String>,
    port: u16,
}

impl KubeMembership {
    /// `own_pod` is excluded from the peer set; pass `None` to probe ourselves too.
    pub fn new(
        client: Client,
        namespace: &str,
        label_selector: impl Into<String>,
        own_pod: Option<String>,
        port: u16,
    ) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            nodes: Api::all(client),
            label_selector: label_selector.into(),
            own_pod,
            port,
        }
    }
}

#[async_trait::async_trait]
impl MembershipSource for KubeMembership {
    async fn list_peers(&self) -> Result<Vec<Peer>, DiscoveryError> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(&self.label_selector))
            .await
            .map_err(|e| DiscoveryError::Unreachable(format!("listing pods: {e}")))?;

        let nodes = self
            .nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| DiscoveryError::Unreachable(format!("listing nodes: {e}")))?;

        let node_zones: HashMap<String, String> = nodes
            .items
            .iter()
            .filter_map(|node| {
                let name = node.metadata.name.clone()?;
                let zone = zone_from_labels(node.metadata.labels.as_ref())?;
                Some((name, zone))
            })
            .collect();

        peers_from_pods(&pods.items, &node_zones, self.own_pod.as_deref(), self.port)
    }
}

/// Turn a pod listing into peers.
///
/// Pods that are not running, have no IP yet, or are terminating are not members.
/// A running pod with an unparsable IP fails the whole listing.
pub fn peers_from_pods(
    pods: &[Pod],
    node_zones: &HashMap<String, String>,
    own_pod: Option<&str>,
    port: u16,
) -> Result<Vec<Peer>, DiscoveryError> {
    let mut peers = Vec::with_capacity(pods.len());

    for pod in pods {
        let Some(name) = pod.metadata.name.as_deref() else {
            continue;
        };
        if own_pod == Some(name) || pod.metadata.deletion_timestamp.is_some() {
            continue;
        }

        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        if status.phase.as_deref() != Some("Running") {
            continue;
        }
        let Some(raw_ip) = status.pod_ip.as_deref().filter(|ip| !ip.is_empty()) else {
            debug!(pod = name, "Skipping running pod without an IP");
            continue;
        };
        let ip: IpAddr = raw_ip
            .parse()
            .map_err(|_| DiscoveryError::Malformed(format!("pod {name} has invalid IP {raw_ip}")))?;

        let zone = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_ref())
            .and_then(|node| node_zones.get(node))
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ZONE.to_string());

        peers.push(Peer::new(name, SocketAddr::new(ip, port), zone));
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn pod(name: &str, phase: &str, ip: Option<&str>, node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            spec: Some(PodSpec { node_name: Some(node.to_string()), ..Default::default() }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    fn zones() -> HashMap<String, String> {
        HashMap::from([
            ("node-a".to_string(), "eu-west-1a".to_string()),
            ("node-b".to_string(), "eu-west-1b".to_string()),
        ])
    }

    #[test]
    fn test_running_pods_become_peers() {
        let pods = vec![
            pod("latency-1", "Running", Some("10.0.0.1"), "node-a"),
            pod("latency-2", "Running", Some("10.0.0.2"), "node-b"),
        ];

        let peers = peers_from_pods(&pods, &zones(), None, 8080).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "latency-1");
        assert_eq!(peers[0].address, "10.0.0.1:8080".parse().unwrap());
        assert_eq!(peers[0].zone, "eu-west-1a");
        assert_eq!(peers[1].zone, "eu-west-1b");
    }

    #[test]
    fn test_non_members_are_skipped() {
        let mut terminating = pod("latency-4", "Running", Some("10.0.0.4"), "node-a");
        terminating.metadata.deletion_timestamp = Some(Time(Default::default()));

        let pods = vec![
            pod("self", "Running", Some("10.0.0.9"), "node-a"),
            pod("latency-2", "Pending", Some("10.0.0.2"), "node-a"),
            pod("latency-3", "Running", None, "node-a"),
            terminating,
            pod("latency-5", "Running", Some("10.0.0.5"), "node-b"),
        ];

        let peers = peers_from_pods(&pods, &zones(), Some("self"), 8080).unwrap();
        let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["latency-5"]);
    }

    #[test]
    fn test_include_self_when_not_excluded() {
        let pods = vec![pod("self", "Running", Some("10.0.0.9"), "node-a")];
        let peers = peers_from_pods(&pods, &zones(), None, 8080).unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_unknown_node_zone() {
        let pods = vec![pod("latency-1", "Running", Some("fd00::1"), "node-z")];
        let peers = peers_from_pods(&pods, &zones(), None, 8080).unwrap();
        assert_eq!(peers[0].zone, UNKNOWN_ZONE);
        assert_eq!(peers[0].address.to_string(), "[fd00::1]:8080");
    }

    #[test]
    fn test_bad_ip_fails_whole_listing() {
        let pods = vec![
            pod("latency-1", "Running", Some("10.0.0.1"), "node-a"),
            pod("latency-2", "Running", Some("not-an-ip"), "node-a"),
        ];
        let result = peers_from_pods(&pods, &zones(), None, 8080);
        assert!(matches!(result, Err(DiscoveryError::Malformed(_))));
    }

    #[test]
    fn test_zone_label_precedence() {
        let mut labels = BTreeMap::new();
        assert_eq!(zone_from_labels(Some(&labels)), None);

        labels.insert("failure-domain.beta.kubernetes.io/zone".to_string(), "legacy".to_string());
        assert_eq!(zone_from_labels(Some(&labels)).as_deref(), Some("legacy"));

        labels.insert("topology.kubernetes.io/zone".to_string(), "modern".to_string());
        assert_eq!(zone_from_labels(Some(&labels)).as_deref(), Some("modern"));

        assert_eq!(zone_from_labels(None), None);
    }

    #[test]
    fn test_empty_preferred_label_falls_back() {
        let labels = BTreeMap::from([
            ("topology.kubernetes.io/zone".to_string(), String::new()),
            ("failure-domain.beta.kubernetes.io/zone".to_string(), "legacy".to_string()),
        ]);
        assert_eq!(zone_from_labels(Some(&labels)).as_deref(), Some("legacy"));

        let only_empty = BTreeMap::from([("topology.kubernetes.io/zone".to_string(), String::new())]);
        assert_eq!(zone_from_labels(Some(&only_empty)), None);
    }
}
