// src/config.rs

//! Process configuration: loading, defaulting, and validation. Mirrors the
//! teacher's `config::Config::from_file` shape (TOML file layered with
//! environment overrides, validated once at startup) trimmed to the
//! settings this core actually consumes.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6379
}
fn default_protocol_port() -> u16 {
    16379
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10_000
}
fn default_databases() -> usize {
    16
}
fn default_backlog_capacity_bytes() -> usize {
    1024 * 1024
}

/// This node's role configuration. `Primary` needs no extra fields today;
/// `Replica` names the primary it should connect to at startup (service
/// discovery takes over from there on failover).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ReplicationRoleConfig {
    Primary,
    Replica {
        primary_host: String,
        primary_port: u16,
    },
}

impl Default for ReplicationRoleConfig {
    fn default() -> Self {
        Self::Primary
    }
}

/// Settings for the election-client poll cadence and the discovery key
/// namespace this node registers itself under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default = "default_election_recheck_secs")]
    pub recheck_interval_secs: u64,
}

fn default_election_recheck_secs() -> u64 {
    5
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            recheck_interval_secs: default_election_recheck_secs(),
        }
    }
}

/// The fully resolved, validated configuration this node runs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    /// The client command port (C1/C9 traffic).
    #[serde(default = "default_port")]
    pub port: u16,
    /// The replication transport port (§6 message tags 100-109). Always a
    /// distinct port from `port` per §4.7.8.
    #[serde(default = "default_protocol_port")]
    pub protocol_port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_databases")]
    pub databases: usize,
    /// Stable identity used to derive this node's service-discovery id
    /// (`"{node_id}-cache"`); falls back to `host:port` when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_backlog_capacity_bytes")]
    pub backlog_capacity_bytes: usize,
    #[serde(default)]
    pub replication: ReplicationRoleConfig,
    #[serde(default)]
    pub election: ElectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol_port: default_protocol_port(),
            password: None,
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            databases: default_databases(),
            node_id: None,
            backlog_capacity_bytes: default_backlog_capacity_bytes(),
            replication: ReplicationRoleConfig::default(),
            election: ElectionConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file layered with `CACHE_`-prefixed
    /// environment variable overrides (e.g. `CACHE_PORT=6380`), matching
    /// the teacher's layered-builder approach.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("CACHE").separator("__"));
        let raw = builder.build()?;
        let cfg: Config = raw.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.protocol_port == 0 {
            return Err(anyhow!("protocol_port cannot be 0"));
        }
        if self.protocol_port == self.port {
            return Err(anyhow!("protocol_port must differ from the client port"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.databases == 0 {
            return Err(anyhow!("databases cannot be 0"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if let ReplicationRoleConfig::Replica { primary_port, .. } = &self.replication
            && *primary_port == 0
        {
            return Err(anyhow!("primary_port cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_matching_ports() {
        let mut cfg = Config::default();
        cfg.protocol_port = cfg.port;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_replica_without_primary_port() {
        let mut cfg = Config::default();
        cfg.replication = ReplicationRoleConfig::Replica {
            primary_host: "10.0.0.1".into(),
            primary_port: 0,
        };
        assert!(cfg.validate().is_err());
    }
}
