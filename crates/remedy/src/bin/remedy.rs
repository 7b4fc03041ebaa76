//! Remedy CLI - repair the pods and host services behind metric anomalies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use remedy::{
    local_addresses, run_recovery, DeletionWatcher, Executor, ExecutorOptions, KubeCluster,
    QueryResult, RecoveryContext, RemedyConfig, RuleResult,
};

/// Remedy CLI - anomaly remediation for Kubernetes clusters.
#[derive(Parser)]
#[command(name = "remedy")]
#[command(about = "Repair pods and host services flagged by monitoring rules")]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Path to a kubeconfig file (defaults to in-cluster or `~/.kube/config`).
    #[arg(long, env = "REMEDY_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Deadline for a single command in seconds (0 disables it).
    #[arg(long, env = "REMEDY_COMMAND_TIMEOUT", default_value = "600")]
    command_timeout: u64,

    /// SSH connect timeout in seconds.
    #[arg(long, env = "REMEDY_CONNECT_TIMEOUT", default_value = "10")]
    connect_timeout: u64,

    /// How long to wait for a deleted pod to disappear, in seconds.
    #[arg(long, env = "REMEDY_WATCH_TIMEOUT", default_value = "300")]
    watch_timeout: u64,

    /// Do not stream command output while commands run.
    #[arg(long, default_value = "false")]
    no_stream: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recovery pass for a set of matched rule results.
    Run {
        /// Host registry and rule file (YAML).
        #[arg(long, env = "REMEDY_CONFIG")]
        config: PathBuf,

        /// Matched results: JSON object of rule name to query `data`.
        #[arg(long)]
        results: PathBuf,
    },

    /// Check that registry hosts accept a session.
    Ping {
        /// Host registry file (YAML).
        #[arg(long, env = "REMEDY_CONFIG")]
        config: PathBuf,

        /// Only ping this host.
        #[arg(long)]
        host: Option<IpAddr>,
    },

    /// Run one command on a registry host and print its output.
    Exec {
        /// Host registry file (YAML).
        #[arg(long, env = "REMEDY_CONFIG")]
        config: PathBuf,

        /// Target host.
        #[arg(long)]
        host: IpAddr,

        /// Command to run (joined with spaces).
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

impl Cli {
    fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            command_timeout: (self.command_timeout > 0)
                .then(|| Duration::from_secs(self.command_timeout)),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            stream_output: !self.no_stream,
        }
    }

    async fn cluster(&self) -> Result<KubeCluster> {
        let cluster = match &self.kubeconfig {
            Some(path) => KubeCluster::from_kubeconfig(path).await,
            None => KubeCluster::try_default().await,
        };
        cluster.context("Failed to create Kubernetes client")
    }
}

fn load_config(path: &Path) -> Result<RemedyConfig> {
    RemedyConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn discover_local_addresses() -> Vec<IpAddr> {
    match local_addresses() {
        Ok(addresses) => {
            debug!(count = addresses.len(), "Discovered local addresses");
            addresses
        }
        Err(e) => {
            warn!(error = %e, "Failed to list local addresses, treating every host as remote");
            Vec::new()
        }
    }
}

/// Pair each configured rule with its matched result, in config order.
fn join_results(config: &RemedyConfig, path: &Path) -> Result<Vec<RuleResult>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read results {}", path.display()))?;
    let mut matched: HashMap<String, QueryResult> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse results {}", path.display()))?;

    let joined: Vec<RuleResult> = config
        .rules
        .iter()
        .filter_map(|rule| {
            let result = matched.remove(&rule.name);
            if result.is_none() {
                debug!(rule = %rule.name, "No matched result for rule");
            }
            result.map(|result| RuleResult {
                rule: rule.clone(),
                result,
            })
        })
        .collect();

    for name in matched.keys() {
        warn!(rule = %name, "Result for unknown rule ignored");
    }
    Ok(joined)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Run { config, results } => {
            let config = load_config(config)?;
            let rule_results = join_results(&config, results)?;
            info!(rules = rule_results.len(), "Loaded matched rule results");

            let executor = Executor::new(
                Arc::new(config.registry),
                discover_local_addresses(),
                cli.executor_options(),
            );
            let ctx = RecoveryContext::new(Arc::new(cli.cluster().await?), executor)
                .with_watcher(DeletionWatcher::new(Duration::from_secs(cli.watch_timeout)));

            run_recovery(&rule_results, &ctx)
                .await
                .context("Recovery pass failed")?;
            info!("Recovery pass completed");
        }

        Commands::Ping { config, host } => {
            let config = load_config(config)?;
            let hosts: Vec<IpAddr> = match host {
                Some(host) => vec![*host],
                None => config.registry.addresses().collect(),
            };
            let executor = Executor::new(
                Arc::new(config.registry),
                discover_local_addresses(),
                cli.executor_options(),
            );

            let mut failed = 0usize;
            for host in &hosts {
                match executor.ping(*host).await {
                    Ok(()) => println!("{host:<40} ok"),
                    Err(e) => {
                        failed += 1;
                        println!("{host:<40} {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} hosts unreachable", hosts.len());
            }
        }

        Commands::Exec {
            config,
            host,
            command,
        } => {
            let config = load_config(config)?;
            let options = ExecutorOptions {
                stream_output: false,
                ..cli.executor_options()
            };
            let executor = Executor::new(
                Arc::new(config.registry),
                discover_local_addresses(),
                options,
            );

            let command = command.join(" ");
            let output = executor
                .execute(*host, &command)
                .await
                .with_context(|| format!("Command failed on {host}"))?;
            print!("{output}");
        }
    }

    Ok(())
}
