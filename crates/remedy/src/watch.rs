//! Bounded wait for a deleted pod to disappear.
//!
//! Runs after the delete call already succeeded, so every terminal state is
//! a success for the caller. Only failing to open the watch, which includes
//! its initial listing, is an error.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, PodWatchEvent};
use crate::error::Result;

/// How long to wait for the deletion event.
pub const DEFAULT_DELETION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Terminal state of a deletion watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The control plane reported the pod gone.
    Confirmed,
    /// The bound elapsed without a deletion event.
    TimedOut,
    /// The event stream ended before either of the above.
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum WatchState {
    Watching { listing: bool, seen_in_listing: bool },
    Done(WatchOutcome),
}

impl WatchState {
    fn on_event(self, event: PodWatchEvent) -> Self {
        let Self::Watching {
            listing,
            seen_in_listing,
        } = self
        else {
            return self;
        };
        match event {
            PodWatchEvent::Deleted => Self::Done(WatchOutcome::Confirmed),
            PodWatchEvent::ListStarted => Self::Watching {
                listing: true,
                seen_in_listing: false,
            },
            PodWatchEvent::Applied => Self::Watching {
                listing,
                seen_in_listing: seen_in_listing || listing,
            },
            // A completed listing without the pod means it is already gone.
            PodWatchEvent::ListDone if listing && !seen_in_listing => {
                Self::Done(WatchOutcome::Confirmed)
            }
            PodWatchEvent::ListDone => Self::Watching {
                listing: false,
                seen_in_listing,
            },
        }
    }
}

/// Waits, with a fixed bound, for a pod deletion to be observed.
#[derive(Debug, Clone, Copy)]
pub struct DeletionWatcher {
    timeout: Duration,
}

impl Default for DeletionWatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DELETION_TIMEOUT)
    }
}

impl DeletionWatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn wait(
        &self,
        cluster: &dyn ClusterClient,
        namespace: &str,
        name: &str,
    ) -> Result<WatchOutcome> {
        let mut events = cluster.watch_pod(namespace, name).await?;
        let deadline = Instant::now() + self.timeout;
        let mut state = WatchState::Watching {
            listing: false,
            seen_in_listing: false,
        };

        let outcome = loop {
            if let WatchState::Done(outcome) = state {
                break outcome;
            }
            match timeout_at(deadline, events.next()).await {
                Err(_) => break WatchOutcome::TimedOut,
                Ok(None) => break WatchOutcome::Closed,
                Ok(Some(Ok(event))) => {
                    debug!(pod = %name, event = ?event, "Pod watch event");
                    state = state.on_event(event);
                }
                Ok(Some(Err(e))) => {
                    warn!(pod = %name, namespace = %namespace, error = %e, "Pod watch error");
                }
            }
        };

        match outcome {
            WatchOutcome::Confirmed => {
                info!(pod = %name, namespace = %namespace, "Pod has been deleted");
            }
            WatchOutcome::TimedOut => warn!(
                pod = %name,
                namespace = %namespace,
                timeout_secs = self.timeout.as_secs(),
                "Timeout waiting for pod to be deleted"
            ),
            WatchOutcome::Closed => {
                debug!(pod = %name, namespace = %namespace, "Pod watch closed");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{PodSummary, PodWatchStream};
    use crate::error::Error;
    use async_trait::async_trait;
    use futures::stream;
    use k8s_openapi::api::core::v1::Pod;
    use std::sync::Mutex;

    /// Serves one scripted watch stream.
    struct ScriptedWatch(Mutex<Option<PodWatchStream>>);

    impl ScriptedWatch {
        fn new(events: PodWatchStream) -> Self {
            Self(Mutex::new(Some(events)))
        }
    }

    #[async_trait]
    impl ClusterClient for ScriptedWatch {
        async fn list_pods(&self, _: &str) -> Result<Vec<PodSummary>> {
            Ok(vec![])
        }

        async fn get_pod(&self, _: &str, _: &str) -> Result<Pod> {
            Err(Error::cluster("get pod", "unsupported"))
        }

        async fn replace_pod(&self, _: &str, _: &str, _: &Pod) -> Result<Pod> {
            Err(Error::cluster("update pod", "unsupported"))
        }

        async fn delete_pod(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn watch_pod(&self, _: &str, _: &str) -> Result<PodWatchStream> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::cluster("watch pods", "already consumed"))
        }
    }

    fn delayed(events: Vec<(u64, PodWatchEvent)>) -> PodWatchStream {
        stream::iter(events)
            .then(|(delay_secs, event)| async move {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                Ok(event)
            })
            .chain(stream::pending())
            .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_within_bound_confirms_early() {
        let cluster = ScriptedWatch::new(delayed(vec![
            (0, PodWatchEvent::ListStarted),
            (0, PodWatchEvent::Applied),
            (0, PodWatchEvent::ListDone),
            (30, PodWatchEvent::Deleted),
        ]));
        let start = Instant::now();

        let outcome = DeletionWatcher::default()
            .wait(&cluster, "prod", "api-0")
            .await
            .unwrap();

        assert_eq!(outcome, WatchOutcome::Confirmed);
        assert!(start.elapsed() < DEFAULT_DELETION_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_waits_full_bound() {
        let cluster = ScriptedWatch::new(stream::pending().boxed());
        let start = Instant::now();

        let outcome = DeletionWatcher::default()
            .wait(&cluster, "prod", "api-0")
            .await
            .unwrap();

        assert_eq!(outcome, WatchOutcome::TimedOut);
        assert!(start.elapsed() >= DEFAULT_DELETION_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modifications_do_not_confirm() {
        let cluster = ScriptedWatch::new(delayed(vec![
            (0, PodWatchEvent::ListStarted),
            (0, PodWatchEvent::Applied),
            (0, PodWatchEvent::ListDone),
            (10, PodWatchEvent::Applied),
            (10, PodWatchEvent::Applied),
        ]));
        let watcher = DeletionWatcher::new(Duration::from_secs(60));
        let start = Instant::now();

        let outcome = watcher.wait(&cluster, "prod", "api-0").await.unwrap();
        assert_eq!(outcome, WatchOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_absent_from_listing_is_confirmed() {
        let cluster = ScriptedWatch::new(delayed(vec![
            (0, PodWatchEvent::ListStarted),
            (0, PodWatchEvent::ListDone),
        ]));

        let outcome = DeletionWatcher::default()
            .wait(&cluster, "prod", "api-0")
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_errors_are_tolerated() {
        let events: PodWatchStream = stream::iter(vec![
            Err(Error::cluster("watch pods", "connection reset")),
            Ok(PodWatchEvent::Deleted),
        ])
        .boxed();
        let cluster = ScriptedWatch::new(events);

        let outcome = DeletionWatcher::default()
            .wait(&cluster, "prod", "api-0")
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_closed_stream_is_success() {
        let cluster = ScriptedWatch::new(stream::empty().boxed());

        let outcome = DeletionWatcher::default()
            .wait(&cluster, "prod", "api-0")
            .await
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Closed);
    }

    #[tokio::test]
    async fn test_watch_open_failure_propagates() {
        let cluster = ScriptedWatch(Mutex::new(None));

        let err = DeletionWatcher::default()
            .wait(&cluster, "prod", "api-0")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterApi { operation: "watch pods", .. }));
    }
}
