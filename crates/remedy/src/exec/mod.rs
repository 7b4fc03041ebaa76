//! Command execution on cluster hosts.
//!
//! [`Executor`] runs a shell command against a host address. When the
//! address belongs to this machine the command runs in a local `/bin/sh`
//! child; otherwise it goes through a [`RemoteTransport`] (SSH by default)
//! using the credential resolved from the [`HostRegistry`]. Both paths
//! capture stdout and stderr together, treat a non-zero exit as failure and
//! can stream output lines to an [`OutputSink`] while the command runs.

mod local;
mod net;
mod ssh;

pub use net::{is_local, local_addresses};
pub use ssh::SshTransport;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{HostCredential, HostRegistry};
use crate::error::{Error, Result};

/// Receives command output line by line, as it arrives.
pub type OutputSink = Arc<dyn Fn(IpAddr, &str) + Send + Sync>;

/// Sink that emits each line as an `info` event.
pub fn log_sink() -> OutputSink {
    Arc::new(|host: IpAddr, line: &str| info!(host = %host, "{}", line))
}

/// Exit status and combined stdout/stderr of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub output: String,
}

/// Everything needed to run a command on one host.
#[derive(Debug, Clone)]
pub struct ExecutionTarget {
    pub host: IpAddr,
    pub credential: HostCredential,
    pub env: Vec<(String, String)>,
}

/// Which path a command for a given host takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Local,
    Remote,
}

/// A way of running commands on a host that is not this machine.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open a session, run `command`, close the session.
    ///
    /// When `deadline` is set the transport enforces it itself and releases
    /// the session before returning [`Error::CommandTimeout`].
    async fn run(
        &self,
        target: &ExecutionTarget,
        command: &str,
        deadline: Option<Duration>,
        sink: Option<OutputSink>,
    ) -> Result<CommandOutput>;

    /// Open a session and close it immediately.
    async fn ping(&self, target: &ExecutionTarget) -> Result<()>;
}

/// Tunables for [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Deadline for a single command, including session setup.
    pub command_timeout: Option<Duration>,
    /// Timeout for establishing the TCP connection of a remote session.
    pub connect_timeout: Duration,
    /// Stream output lines to the sink while commands run.
    pub stream_output: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            command_timeout: Some(Duration::from_secs(600)),
            connect_timeout: Duration::from_secs(10),
            stream_output: true,
        }
    }
}

/// Wrap `command` so it runs as root through a non-interactive shell.
pub fn wrap_privileged(command: &str) -> String {
    format!("sudo -E /bin/sh <<EOF\n{command}\nEOF")
}

/// Runs commands on registered hosts.
pub struct Executor {
    registry: Arc<HostRegistry>,
    local_addresses: Vec<IpAddr>,
    remote: Arc<dyn RemoteTransport>,
    options: ExecutorOptions,
    sink: OutputSink,
}

impl Executor {
    /// Create an executor that reaches remote hosts over SSH.
    ///
    /// `local_addresses` decides which hosts are this machine; resolve it
    /// once per pass with [`local_addresses`].
    pub fn new(
        registry: Arc<HostRegistry>,
        local_addresses: Vec<IpAddr>,
        options: ExecutorOptions,
    ) -> Self {
        let remote = Arc::new(SshTransport::new(options.connect_timeout));
        Self {
            registry,
            local_addresses,
            remote,
            options,
            sink: log_sink(),
        }
    }

    #[must_use]
    pub fn with_transport(mut self, remote: Arc<dyn RemoteTransport>) -> Self {
        self.remote = remote;
        self
    }

    #[must_use]
    pub fn with_output_sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn transport_for(&self, host: IpAddr) -> Transport {
        if is_local(host, &self.local_addresses) {
            Transport::Local
        } else {
            Transport::Remote
        }
    }

    /// Resolve credential and environment for `host`.
    pub fn target(&self, host: IpAddr) -> Result<ExecutionTarget> {
        let credential = self.registry.resolve_credential(host)?;
        let env = self
            .registry
            .entry(host)
            .map(|entry| entry.env_pairs())
            .unwrap_or_default();
        Ok(ExecutionTarget {
            host,
            credential,
            env,
        })
    }

    /// Run `command` on `host` and return its combined output.
    pub async fn execute(&self, host: IpAddr, command: &str) -> Result<String> {
        let target = self.target(host)?;
        self.run(&target, command).await
    }

    /// Run `commands` on `host` one after another, stopping at the first
    /// failure. Empty commands are skipped.
    pub async fn execute_async<S: AsRef<str>>(&self, host: IpAddr, commands: &[S]) -> Result<()> {
        let target = self.target(host)?;
        for command in commands {
            let command = command.as_ref();
            if command.is_empty() {
                continue;
            }
            if let Err(e) = self.run(&target, command).await {
                info!(host = %host, command = %command, error = %e, "Command failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run `command` and join its output lines with `split`.
    ///
    /// A remote command that produces no output at all is reported as
    /// [`Error::EmptyOutput`].
    pub async fn execute_to_string(&self, host: IpAddr, command: &str, split: &str) -> Result<String> {
        let output = self.execute(host, command).await?;
        if output.is_empty() && self.transport_for(host) == Transport::Remote {
            return Err(Error::EmptyOutput {
                host,
                command: command.to_string(),
            });
        }
        Ok(output.replace("\r\n", split).replace('\n', split))
    }

    /// Check that `host` is reachable. Local addresses always are.
    pub async fn ping(&self, host: IpAddr) -> Result<()> {
        if self.transport_for(host) == Transport::Local {
            return Ok(());
        }
        let target = self.target(host)?;
        self.remote.ping(&target).await
    }

    async fn run(&self, target: &ExecutionTarget, command: &str) -> Result<String> {
        let host = target.host;
        let wrapped = if target.credential.is_root() {
            command.to_string()
        } else {
            wrap_privileged(command)
        };
        let sink = self.options.stream_output.then(|| self.sink.clone());
        let transport = self.transport_for(host);
        debug!(host = %host, transport = ?transport, command = %wrapped, "Running command");

        let finished = match transport {
            Transport::Local => match self.options.command_timeout {
                // Dropping the child kills it.
                Some(limit) => tokio::time::timeout(limit, local::run(target, &wrapped, sink.as_ref()))
                    .await
                    .map_err(|_| Error::CommandTimeout {
                        host,
                        command: wrapped.clone(),
                        after: limit,
                    })?,
                None => local::run(target, &wrapped, sink.as_ref()).await,
            },
            Transport::Remote => {
                self.remote
                    .run(target, &wrapped, self.options.command_timeout, sink)
                    .await
            }
        }?;

        if finished.status != 0 {
            warn!(
                host = %host,
                command = %wrapped,
                status = finished.status,
                "Command exited non-zero"
            );
            return Err(Error::CommandFailed {
                host,
                command: wrapped,
                status: finished.status,
                output: finished.output,
            });
        }
        Ok(finished.output)
    }
}
