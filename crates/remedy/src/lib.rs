//! Remediation engine for cluster anomalies.
//!
//! Metric query results are classified into pod or host-service anomalies,
//! and each anomaly is repaired with a configured action: delete or restart
//! a pod through the control plane, or run a command on the host the
//! workload is scheduled on, locally or over SSH.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use remedy::{Executor, ExecutorOptions, KubeCluster, RecoveryContext, RemedyConfig};
//!
//! let config = RemedyConfig::load(Path::new("remedy.yaml"))?;
//! let executor = Executor::new(
//!     Arc::new(config.registry),
//!     remedy::local_addresses()?,
//!     ExecutorOptions::default(),
//! );
//! let ctx = RecoveryContext::new(Arc::new(KubeCluster::try_default().await?), executor);
//!
//! let records = remedy::classify(&result, false)?;
//! remedy::recover_all(&records, &ctx, "delete").await?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod anomaly;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod query;
pub mod recover;
pub mod watch;

pub use anomaly::{classify, classify_as, AnomalyRecord, PodAnomaly, ServiceAnomaly};
pub use cluster::{resolve_host, ClusterClient, HostLocation, KubeCluster};
pub use config::{HostCredential, HostEntry, HostRegistry, RecoveryKind, RemedyConfig, Rule};
pub use error::{Error, Result};
pub use exec::{local_addresses, Executor, ExecutorOptions, RemoteTransport, SshTransport};
pub use query::QueryResult;
pub use recover::{recover_all, run_recovery, RecoveryContext, RuleResult};
pub use watch::{DeletionWatcher, WatchOutcome};
