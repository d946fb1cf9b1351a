//! Top-level configuration.
//!
//! Loaded from TOML by the daemon, validated once at startup. Components
//! receive the parts they need by value; nothing re-reads configuration at
//! runtime.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid proxy port range {start}-{end}: {reason}")]
    InvalidPortRange {
        start: u16,
        end: u16,
        reason: &'static str,
    },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Inclusive range of per-node ports reservable for deployment ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 10_000,
            end: 20_000,
        }
    }
}

impl PortRange {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start == 0 {
            return Err(ConfigError::InvalidPortRange {
                start: self.start,
                end: self.end,
                reason: "start must be non-zero",
            });
        }
        if self.start > self.end {
            return Err(ConfigError::InvalidPortRange {
                start: self.start,
                end: self.end,
                reason: "start exceeds end",
            });
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// Worker cadence. Defaults match the reconciliation contracts; tests shrink
/// them to drive ticks quickly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerIntervals {
    pub provisioner_secs: u64,
    pub health_secs: u64,
    pub domain_verify_secs: u64,
    pub usage_report_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            provisioner_secs: 10,
            health_secs: 30,
            domain_verify_secs: 300,
            usage_report_secs: 60,
        }
    }
}

fn default_local_host() -> String {
    "localhost".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/var/lib/hoster/deployments")
}

fn default_local_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_resolvers() -> Vec<IpAddr> {
    vec![
        IpAddr::from([8, 8, 8, 8]),
        IpAddr::from([1, 1, 1, 1]),
        IpAddr::from([9, 9, 9, 9]),
    ]
}

/// Everything the daemon needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HosterConfig {
    /// Base domain that auto-domains hang off (`<name>-<suffix>.<base>`).
    pub base_domain: String,

    /// Host string identifying the node that shares this process's container
    /// socket. Scheduling onto it uses the local client, not SSH.
    #[serde(default = "default_local_host")]
    pub local_node_host: String,

    /// Container runtime socket for the local node.
    #[serde(default = "default_local_socket")]
    pub local_container_socket: String,

    /// Root directory for per-deployment config-file material.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default)]
    pub proxy_ports: PortRange,

    #[serde(default)]
    pub workers: WorkerIntervals,

    /// Public DNS resolvers queried in parallel during domain verification.
    #[serde(default = "default_resolvers")]
    pub dns_resolvers: Vec<IpAddr>,
}

impl HosterConfig {
    /// Startup validation. An invalid proxy-port range is a hard failure by
    /// contract, not a warning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_domain.is_empty() {
            return Err(ConfigError::Missing("base_domain"));
        }
        if self.base_domain.starts_with('.') || self.base_domain.ends_with('.') {
            return Err(ConfigError::Invalid {
                field: "base_domain",
                reason: "must not begin or end with a dot".to_string(),
            });
        }
        self.proxy_ports.validate()?;
        if self.dns_resolvers.is_empty() {
            return Err(ConfigError::Missing("dns_resolvers"));
        }
        let w = &self.workers;
        for (field, value) in [
            ("workers.provisioner_secs", w.provisioner_secs),
            ("workers.health_secs", w.health_secs),
            ("workers.domain_verify_secs", w.domain_verify_secs),
            ("workers.usage_report_secs", w.usage_report_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: "workers",
                    reason: format!("{field} must be non-zero"),
                });
            }
        }
        Ok(())
    }
}
