//! Recovery dispatch.
//!
//! Each [`AnomalyRecord`] variant knows how to repair itself given a
//! [`RecoveryContext`]. Records are processed one at a time and the first
//! failure stops the rest of the list; nothing already done is rolled back.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::anomaly::{classify_as, AnomalyRecord, PodAnomaly, ServiceAnomaly};
use crate::cluster::{resolve_host, ClusterClient, HostLocation};
use crate::config::Rule;
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::query::QueryResult;
use crate::watch::DeletionWatcher;

/// Identity recorded on pods restarted by this engine.
pub const SYSTEM_NAME: &str = "patrol";

pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
pub const RESTARTED_BY_ANNOTATION: &str = "kubectl.kubernetes.io/restartedBy";

/// Service-manager verbs that are applied to the named unit.
pub const LIFECYCLE_VERBS: [&str; 5] = ["start", "stop", "restart", "enable", "disable"];

/// What to do with a faulty pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodAction {
    Delete,
    Restart,
    /// Any other action string, run on the pod's host.
    Shell(String),
}

impl PodAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "delete" => Self::Delete,
            "restart" => Self::Restart,
            other => Self::Shell(other.to_string()),
        }
    }
}

/// What to do with a faulty host service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    Lifecycle(&'static str),
    Shell(String),
}

impl ServiceAction {
    pub fn parse(action: &str) -> Self {
        LIFECYCLE_VERBS
            .iter()
            .find(|verb| **verb == action)
            .map_or_else(|| Self::Shell(action.to_string()), |verb| Self::Lifecycle(*verb))
    }

    /// The shell command to run for `service`.
    pub fn command(&self, service: &str) -> String {
        match self {
            Self::Lifecycle(verb) => format!("systemctl {verb} {service}"),
            Self::Shell(command) => command.clone(),
        }
    }
}

/// Collaborators shared by every recovery in a pass.
pub struct RecoveryContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub executor: Executor,
    pub watcher: DeletionWatcher,
}

impl RecoveryContext {
    pub fn new(cluster: Arc<dyn ClusterClient>, executor: Executor) -> Self {
        Self {
            cluster,
            executor,
            watcher: DeletionWatcher::default(),
        }
    }

    #[must_use]
    pub fn with_watcher(mut self, watcher: DeletionWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    /// Resolve the host of `pod`, failing when it has no usable address.
    async fn locate(&self, pod: &str, namespace: &str) -> Result<(HostLocation, IpAddr)> {
        let location = resolve_host(self.cluster.as_ref(), pod, namespace).await?;
        let ip = location.ip().ok_or_else(|| Error::HostUnresolved {
            pod: pod.to_string(),
            namespace: namespace.to_string(),
        })?;
        Ok((location, ip))
    }

    /// Run `command` on the host of `pod`, streaming its output.
    async fn shell_on_pod_host(&self, pod: &str, namespace: &str, command: &str) -> Result<()> {
        let (location, ip) = self.locate(pod, namespace).await?;
        info!(node = %location.node_name, host = %ip, command = %command, "Running command");
        self.executor.execute_async(ip, &[command]).await?;
        info!(
            node = %location.node_name,
            host = %ip,
            command = %command,
            "Command completed successfully"
        );
        Ok(())
    }
}

impl AnomalyRecord {
    /// Apply `action` to this anomaly.
    pub async fn recover(&self, ctx: &RecoveryContext, action: &str) -> Result<()> {
        match self {
            Self::Pod(pod) => pod.recover(ctx, &PodAction::parse(action)).await,
            Self::Service(service) => service.recover(ctx, &ServiceAction::parse(action)).await,
        }
    }
}

impl PodAnomaly {
    pub async fn recover(&self, ctx: &RecoveryContext, action: &PodAction) -> Result<()> {
        match action {
            PodAction::Delete => self.delete(ctx).await.map_err(|e| Error::DeleteFailed {
                pod: self.name.clone(),
                namespace: self.namespace.clone(),
                source: Box::new(e),
            }),
            PodAction::Restart => self.restart(ctx).await.map_err(|e| Error::RestartFailed {
                pod: self.name.clone(),
                namespace: self.namespace.clone(),
                source: Box::new(e),
            }),
            PodAction::Shell(command) => ctx
                .shell_on_pod_host(&self.name, &self.namespace, command)
                .await
                .map_err(|e| Error::ShellFailed {
                    pod: self.name.clone(),
                    namespace: self.namespace.clone(),
                    command: command.clone(),
                    source: Box::new(e),
                }),
        }
    }

    async fn delete(&self, ctx: &RecoveryContext) -> Result<()> {
        ctx.cluster.delete_pod(&self.namespace, &self.name).await?;
        info!(pod = %self.name, namespace = %self.namespace, "Deleting pod");
        ctx.watcher
            .wait(ctx.cluster.as_ref(), &self.namespace, &self.name)
            .await?;
        Ok(())
    }

    async fn restart(&self, ctx: &RecoveryContext) -> Result<()> {
        let mut pod = ctx.cluster.get_pod(&self.namespace, &self.name).await?;

        let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(RESTARTED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
        annotations.insert(RESTARTED_BY_ANNOTATION.to_string(), SYSTEM_NAME.to_string());

        ctx.cluster
            .replace_pod(&self.namespace, &self.name, &pod)
            .await?;
        info!(pod = %self.name, namespace = %self.namespace, "Restarted pod");
        Ok(())
    }
}

impl ServiceAnomaly {
    pub async fn recover(&self, ctx: &RecoveryContext, action: &ServiceAction) -> Result<()> {
        let command = action.command(&self.service_name);
        ctx.shell_on_pod_host(&self.pod_name, "", &command)
            .await
            .map_err(|e| Error::ServiceActionFailed {
                service: self.service_name.clone(),
                pod: self.pod_name.clone(),
                action: command,
                source: Box::new(e),
            })
    }
}

/// Recover `records` in order, stopping at the first failure.
pub async fn recover_all(records: &[AnomalyRecord], ctx: &RecoveryContext, action: &str) -> Result<()> {
    for (index, record) in records.iter().enumerate() {
        info!(
            record = %record,
            action = %action,
            position = index + 1,
            total = records.len(),
            "Recovering anomaly"
        );
        record.recover(ctx, action).await?;
    }
    Ok(())
}

/// The result a rule matched, paired with the rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: Rule,
    pub result: QueryResult,
}

/// Run recovery for every rule whose recovery is enabled.
///
/// Rules are processed in order; the first failing rule ends the pass.
pub async fn run_recovery(results: &[RuleResult], ctx: &RecoveryContext) -> Result<()> {
    for entry in results {
        let rule = &entry.rule;
        let Some(recovery) = rule.enabled_recovery() else {
            debug!(rule = %rule.name, "Recovery disabled, skipping");
            continue;
        };

        let wrap = |e: Error| Error::Rule {
            rule: rule.name.clone(),
            source: Box::new(e),
        };
        let records = classify_as(&entry.result, recovery.kind).map_err(wrap)?;
        info!(
            rule = %rule.name,
            kind = %recovery.kind,
            anomalies = records.len(),
            "Classified anomalies"
        );
        recover_all(&records, ctx, &recovery.action)
            .await
            .map_err(wrap)?;
    }
    Ok(())
}
