//! Error types for the remediation engine.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while classifying, resolving or repairing an anomaly.
#[derive(Debug, Error)]
pub enum Error {
    /// The query result is neither a vector nor a matrix.
    #[error("unsupported result type: {0}")]
    UnsupportedResultKind(String),

    /// No registry entry lists the host.
    #[error("host ip {0} not in hosts ip list")]
    HostNotRegistered(IpAddr),

    /// The merged credential cannot be used to open a session.
    #[error("invalid ssh credential for {host}: {reason}")]
    InvalidCredential { host: IpAddr, reason: String },

    /// The workload was not found, or has not been scheduled onto a host.
    #[error("no host ip found for pod {pod} (namespace '{namespace}')")]
    HostUnresolved { pod: String, namespace: String },

    /// Local process pipes or the remote session could not be established.
    #[error("[{host}] connection failed: {message}")]
    Connection { host: IpAddr, message: String },

    /// The command ran and exited non-zero.
    #[error("command '{command}' on {host} exited with status {status}")]
    CommandFailed {
        host: IpAddr,
        command: String,
        status: i32,
        output: String,
    },

    /// The remote command returned neither data nor an error.
    #[error("command '{command}' on {host} returned no output")]
    EmptyOutput { host: IpAddr, command: String },

    /// The command did not finish within the caller's deadline.
    #[error("command '{command}' on {host} timed out after {}s", .after.as_secs())]
    CommandTimeout {
        host: IpAddr,
        command: String,
        after: Duration,
    },

    /// A control-plane call failed.
    #[error("cluster api {operation} failed: {message}")]
    ClusterApi {
        operation: &'static str,
        message: String,
    },

    #[error("delete pod {namespace}/{pod} failed")]
    DeleteFailed {
        pod: String,
        namespace: String,
        #[source]
        source: Box<Error>,
    },

    #[error("restart pod {namespace}/{pod} failed")]
    RestartFailed {
        pod: String,
        namespace: String,
        #[source]
        source: Box<Error>,
    },

    #[error("shell '{command}' for pod {namespace}/{pod} failed")]
    ShellFailed {
        pod: String,
        namespace: String,
        command: String,
        #[source]
        source: Box<Error>,
    },

    #[error("service action '{action}' for {service} (pod {pod}) failed")]
    ServiceActionFailed {
        service: String,
        pod: String,
        action: String,
        #[source]
        source: Box<Error>,
    },

    /// Failure while recovering the anomalies matched by one rule.
    #[error("recover rule '{rule}' failed")]
    Rule {
        rule: String,
        #[source]
        source: Box<Error>,
    },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn cluster(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ClusterApi {
            operation,
            message: err.to_string(),
        }
    }

    pub(crate) fn connection(host: IpAddr, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            host,
            message: err.to_string(),
        }
    }

    /// Walks the source chain and returns the innermost cause.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        loop {
            let next = match current {
                Self::DeleteFailed { source, .. }
                | Self::RestartFailed { source, .. }
                | Self::ShellFailed { source, .. }
                | Self::ServiceActionFailed { source, .. }
                | Self::Rule { source, .. } => source.as_ref(),
                _ => return current,
            };
            current = next;
        }
    }
}
