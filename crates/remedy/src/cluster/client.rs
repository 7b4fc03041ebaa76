//! `kube`-backed implementation of [`ClusterClient`].

use std::path::Path;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Config as KubeConfig};
use tracing::{debug, info};

use super::{ClusterClient, PodSummary, PodWatchEvent, PodWatchStream};
use crate::error::{Error, Result};

/// Control-plane client over a `kube::Client`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the environment (in-cluster or `~/.kube/config`).
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::cluster("connect", e))?;
        Ok(Self::new(client))
    }

    /// Build a client from an explicit kubeconfig file.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::Config(format!("Failed to read kubeconfig {}: {e}", path.display()))
        })?;
        let config = KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Config(format!("Invalid kubeconfig {}: {e}", path.display())))?;
        let client = Client::try_from(config).map_err(|e| Error::cluster("connect", e))?;
        info!(kubeconfig = %path.display(), "Created cluster client");
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        if namespace.is_empty() {
            Api::default_namespaced(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

fn watch_event(event: Event<Pod>) -> PodWatchEvent {
    match event {
        Event::Init => PodWatchEvent::ListStarted,
        Event::InitApply(_) | Event::Apply(_) => PodWatchEvent::Applied,
        Event::Delete(_) => PodWatchEvent::Deleted,
        Event::InitDone => PodWatchEvent::ListDone,
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let api: Api<Pod> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::cluster("list pods", e))?;
        Ok(list.items.iter().map(PodSummary::from).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| Error::cluster("get pod", e))
    }

    async fn replace_pod(&self, namespace: &str, name: &str, pod: &Pod) -> Result<Pod> {
        self.pods(namespace)
            .replace(name, &PostParams::default(), pod)
            .await
            .map_err(|e| Error::cluster("update pod", e))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::cluster("delete pod", e))?;
        Ok(())
    }

    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatchStream> {
        let selector = format!("metadata.name={name}");
        debug!(namespace = %namespace, selector = %selector, "Opening pod watch");

        let config = watcher::Config::default().fields(&selector);
        let mut events = watcher::watcher(self.pods(namespace), config)
            .default_backoff()
            .map_ok(watch_event)
            .map_err(|e| Error::cluster("watch pods", e))
            .boxed();

        // The watcher retries forever, so drive it through the initial
        // listing here and fail the open on the first error.
        let mut initial = Vec::new();
        while let Some(event) = events.next().await {
            let event = event?;
            initial.push(Ok(event));
            if event == PodWatchEvent::ListDone {
                break;
            }
        }
        Ok(stream::iter(initial).chain(events).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{DeletionWatcher, WatchOutcome};
    use http::{Request, Response, StatusCode};
    use kube::client::Body;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const POD: &str =
        r#"{"apiVersion":"v1","kind":"Pod","metadata":{"name":"api-0","namespace":"prod","resourceVersion":"2"}}"#;

    /// A cluster whose API server answers every request with `respond`.
    fn mock_cluster(
        respond: fn(&Request<Body>) -> (StatusCode, String),
        hits: Arc<AtomicUsize>,
    ) -> KubeCluster {
        let service = tower::service_fn(move |req: Request<Body>| {
            hits.fetch_add(1, Ordering::SeqCst);
            let (status, body) = respond(&req);
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .body(Body::from(body.into_bytes()))
                        .unwrap(),
                )
            }
        });
        KubeCluster::new(Client::new(service, "default"))
    }

    fn list_then_delete(req: &Request<Body>) -> (StatusCode, String) {
        let query = req.uri().query().unwrap_or_default();
        assert!(query.contains("fieldSelector=metadata.name%3Dapi-0"), "query: {query}");
        if query.contains("watch=true") {
            (StatusCode::OK, format!("{{\"type\":\"DELETED\",\"object\":{POD}}}\n"))
        } else {
            (
                StatusCode::OK,
                format!(
                    r#"{{"apiVersion":"v1","kind":"PodList","metadata":{{"resourceVersion":"1"}},"items":[{POD}]}}"#
                ),
            )
        }
    }

    fn forbidden(_: &Request<Body>) -> (StatusCode, String) {
        (
            StatusCode::FORBIDDEN,
            r#"{"kind":"Status","apiVersion":"v1","metadata":{},"status":"Failure","message":"pods is forbidden","reason":"Forbidden","code":403}"#
                .to_string(),
        )
    }

    #[tokio::test]
    async fn test_watch_maps_runtime_events() {
        let cluster = mock_cluster(list_then_delete, Arc::default());

        let events = tokio::time::timeout(Duration::from_secs(10), async {
            cluster
                .watch_pod("prod", "api-0")
                .await
                .unwrap()
                .take(4)
                .collect::<Vec<_>>()
                .await
        })
        .await
        .unwrap();

        let events: Vec<PodWatchEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                PodWatchEvent::ListStarted,
                PodWatchEvent::Applied,
                PodWatchEvent::ListDone,
                PodWatchEvent::Deleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_deletion_wait_confirms_against_api() {
        let cluster = mock_cluster(list_then_delete, Arc::default());

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            DeletionWatcher::default().wait(&cluster, "prod", "api-0"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome, WatchOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_forbidden_watch_fails_to_open() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cluster = mock_cluster(forbidden, hits.clone());

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            DeletionWatcher::default().wait(&cluster, "prod", "api-0"),
        )
        .await
        .expect("forbidden watch must not wait out the bound")
        .unwrap_err();

        assert!(matches!(err, Error::ClusterApi { operation: "watch pods", .. }), "got {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
