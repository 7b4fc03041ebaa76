//! Cluster control-plane access and host resolution.

mod client;

pub use self::client::KubeCluster;

use std::net::IpAddr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use crate::error::Result;

/// Scheduling facts about a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub host_ip: String,
}

impl From<&Pod> for PodSummary {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            host_ip: pod
                .status
                .as_ref()
                .and_then(|s| s.host_ip.clone())
                .unwrap_or_default(),
        }
    }
}

/// Events observed while watching a single pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodWatchEvent {
    /// A (re)list of the watched scope started.
    ListStarted,
    /// The pod exists (initial listing or a later change).
    Applied,
    /// The pod was deleted.
    Deleted,
    /// The (re)list finished.
    ListDone,
}

/// Stream of watch events for one pod.
pub type PodWatchStream = BoxStream<'static, Result<PodWatchEvent>>;

/// The subset of the control-plane API the engine needs.
///
/// An empty `namespace` means all namespaces for [`list_pods`] and the
/// client's default namespace everywhere else.
///
/// [`list_pods`]: ClusterClient::list_pods
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn replace_pod(&self, namespace: &str, name: &str, pod: &Pod) -> Result<Pod>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Open a watch scoped to the pod named `name`.
    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatchStream>;
}

/// Where a pod runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostLocation {
    pub node_name: String,
    pub host_ip: String,
}

impl HostLocation {
    /// The host address, or `None` when the pod was not found or is not
    /// scheduled yet.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host_ip.trim().parse().ok()
    }
}

/// Find the node and host IP of `pod_name`.
///
/// Returns an empty [`HostLocation`] when no pod matches.
pub async fn resolve_host(
    cluster: &dyn ClusterClient,
    pod_name: &str,
    namespace: &str,
) -> Result<HostLocation> {
    let pods = cluster.list_pods(namespace).await?;
    debug!(
        namespace = %namespace,
        pod_count = pods.len(),
        "Scanning pods for host lookup"
    );

    match pods.into_iter().find(|p| p.name == pod_name) {
        Some(pod) => {
            info!(
                pod = %pod_name,
                node = %pod.node_name,
                host_ip = %pod.host_ip,
                "Pod running on node"
            );
            Ok(HostLocation {
                node_name: pod.node_name,
                host_ip: pod.host_ip,
            })
        }
        None => {
            debug!(pod = %pod_name, namespace = %namespace, "Pod not found");
            Ok(HostLocation::default())
        }
    }
}
