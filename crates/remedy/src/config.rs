//! Host registry, credential merging and rule descriptors.
//!
//! The registry and the rules are read from the same YAML file:
//!
//! ```yaml
//! ssh:
//!   user: ops
//!   passwd: secret
//!   port: "22"
//! hosts:
//!   - ips: [10.0.0.11, 10.0.0.12]
//!     roles: [master]
//!     ssh:
//!       port: "2222"
//!     env: ["HTTPS_PROXY=http://proxy:3128"]
//! rules:
//!   - name: pod-crashloop
//!     expr: kube_pod_container_status_restarts_total > 5
//!     recover:
//!       type: pod
//!       action: delete
//!       enable: true
//! ```

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Superuser name; commands for any other user are wrapped with sudo.
pub const ROOT_USER: &str = "root";

/// Port used when neither the host nor the global credential sets one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH connection parameters.
///
/// An empty field means "unset" and inherits the global value during
/// [`HostCredential::merged_onto`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCredential {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "passwd", skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(rename = "pk", skip_serializing_if = "String::is_empty")]
    pub private_key_path: String,
    #[serde(rename = "pkPasswd", skip_serializing_if = "String::is_empty")]
    pub private_key_passphrase: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub port: String,
}

impl HostCredential {
    /// Overlay `self` onto `global` field by field.
    ///
    /// A field set on `self` always wins; an empty field takes the global
    /// value. `encrypted` is set when either side sets it.
    #[must_use]
    pub fn merged_onto(&self, global: &HostCredential) -> HostCredential {
        fn pick(over: &str, base: &str) -> String {
            let value = if over.is_empty() { base } else { over };
            value.to_string()
        }

        HostCredential {
            encrypted: self.encrypted || global.encrypted,
            user: pick(&self.user, &global.user),
            password: pick(&self.password, &global.password),
            private_key_path: pick(&self.private_key_path, &global.private_key_path),
            private_key_passphrase: pick(
                &self.private_key_passphrase,
                &global.private_key_passphrase,
            ),
            port: pick(&self.port, &global.port),
        }
    }

    /// Effective login user, defaulting to the superuser.
    pub fn user(&self) -> &str {
        if self.user.is_empty() {
            ROOT_USER
        } else {
            &self.user
        }
    }

    pub fn is_root(&self) -> bool {
        self.user() == ROOT_USER
    }

    /// Parsed SSH port, or [`DEFAULT_SSH_PORT`] when unset.
    pub fn port(&self, host: IpAddr) -> Result<u16> {
        if self.port.is_empty() {
            return Ok(DEFAULT_SSH_PORT);
        }
        self.port
            .trim()
            .parse()
            .map_err(|_| Error::InvalidCredential {
                host,
                reason: format!("invalid port '{}'", self.port),
            })
    }
}

/// One registry entry: a set of addresses sharing roles and overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEntry {
    pub ips: Vec<IpAddr>,
    pub roles: Vec<String>,
    /// Overrides applied on top of the global credential.
    pub ssh: HostCredential,
    /// `KEY=VALUE` pairs exported to commands run on these hosts.
    pub env: Vec<String>,
}

impl HostEntry {
    /// Environment pairs parsed from `env`; malformed items are skipped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|item| {
                let (key, value) = item.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    None
                } else {
                    Some((key.to_string(), value.to_string()))
                }
            })
            .collect()
    }
}

/// Registry of known hosts plus the global default credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRegistry {
    pub hosts: Vec<HostEntry>,
    /// Global credential applied to every host.
    pub ssh: HostCredential,
}

impl HostRegistry {
    /// Find the first entry whose address set contains `host`.
    pub fn entry(&self, host: IpAddr) -> Option<&HostEntry> {
        self.hosts.iter().find(|entry| entry.ips.contains(&host))
    }

    /// Resolve the effective credential for `host`.
    pub fn resolve_credential(&self, host: IpAddr) -> Result<HostCredential> {
        let entry = self.entry(host).ok_or(Error::HostNotRegistered(host))?;
        let mut merged = entry.ssh.merged_onto(&self.ssh);
        if merged.user.is_empty() {
            merged.user = ROOT_USER.to_string();
        }
        debug!(host = %host, user = %merged.user, "Resolved host credential");
        Ok(merged)
    }

    /// Every registered address, in registry order.
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.hosts.iter().flat_map(|entry| entry.ips.iter().copied())
    }
}

/// Kind of workload a rule's recovery targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryKind {
    Pod,
    Service,
}

impl std::fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pod => write!(f, "pod"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Recovery descriptor attached to a monitoring rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRule {
    #[serde(rename = "type")]
    pub kind: RecoveryKind,
    #[serde(default)]
    pub action: String,
    #[serde(default, rename = "enable", alias = "enabled")]
    pub enabled: bool,
}

/// A monitoring rule as loaded from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub expr: String,
    #[serde(default, rename = "recover", skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryRule>,
}

impl Rule {
    /// The recovery descriptor, if one is present and enabled.
    pub fn enabled_recovery(&self) -> Option<&RecoveryRule> {
        self.recovery.as_ref().filter(|r| r.enabled)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemedyConfig {
    #[serde(flatten)]
    pub registry: HostRegistry,
    pub rules: Vec<Rule>,
}

impl RemedyConfig {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }
}
