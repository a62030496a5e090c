//! Who this instance is: namespace, pod, node and the node's zone.

use std::env;

use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tracing::info;

use crate::directory::kubernetes::zone_from_labels;
use crate::error::StartupError;

pub const NAMESPACE_ENV: &str = "KUBE_NAMESPACE";
pub const POD_NAME_ENV: &str = "KUBE_POD_NAME";
pub const NODE_NAME_ENV: &str = "KUBE_NODE_NAME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub namespace: String,
    pub pod_name: String,
    pub node_name: String,
    pub zone: String,
}

/// Names taken from the downward API environment, before the zone is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNames {
    pub namespace: String,
    pub pod_name: String,
    pub node_name: String,
}

impl PodNames {
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the names through `lookup`. Unset and empty values are both missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StartupError> {
        let required = |key: &'static str| {
            lookup(key).filter(|value| !value.trim().is_empty()).ok_or(StartupError::MissingEnv(key))
        };

        Ok(Self {
            namespace: required(NAMESPACE_ENV)?,
            pod_name: required(POD_NAME_ENV)?,
            node_name: required(NODE_NAME_ENV)?,
        })
    }

    pub fn with_zone(self, zone: String) -> Identity {
        Identity { namespace: self.namespace, pod_name: self.pod_name, node_name: self.node_name, zone }
    }
}

impl Identity {
    /// Resolve the full identity: names from the environment, zone from our node's labels
    pub async fn resolve(client: Client) -> Result<Self, StartupError> {
        let names = PodNames::from_env()?;
        info!(namespace = %names.namespace, pod = %names.pod_name, node = %names.node_name, "Resolving own zone");

        let nodes: Api<Node> = Api::all(client);
        let node = nodes.get(&names.node_name).await?;
        let zone = zone_from_labels(node.metadata.labels.as_ref())
            .ok_or_else(|| StartupError::MissingZone(names.node_name.clone()))?;

        info!(zone = %zone, "Pod zone resolved");
        Ok(names.with_zone(zone))
    }
}
