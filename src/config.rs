// src/config.rs

//! Defines the server configuration, loaded from a TOML file and resolved
//! into a validated `Config` struct at startup.

use crate::core::cluster::config::ClusterConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// TLS settings for the client port and the cluster bus.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
}

/// Configuration specific to a Primary instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationPrimaryConfig {
    /// How many replicas must be online (acked within `min_replicas_max_lag`)
    /// for the command layer to accept writes. 0 disables the gate.
    #[serde(default)]
    pub min_replicas_to_write: usize,
    #[serde(default = "default_min_replicas_max_lag")]
    pub min_replicas_max_lag: u64,
    /// If true, full resyncs stream the snapshot straight into the replica
    /// socket instead of going through a temp file.
    #[serde(default = "default_true")]
    pub diskless_sync: bool,
    /// Whether replicas advertising `capa dual-channel` are offered the
    /// two-connection full-sync path.
    #[serde(default = "default_true")]
    pub dual_channel: bool,
}

impl Default for ReplicationPrimaryConfig {
    fn default() -> Self {
        Self {
            min_replicas_to_write: 0,
            min_replicas_max_lag: default_min_replicas_max_lag(),
            diskless_sync: true,
            dual_channel: true,
        }
    }
}

fn default_min_replicas_max_lag() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

/// Defines the server's role in replication.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ReplicationConfig {
    Primary(ReplicationPrimaryConfig),
    Replica {
        primary_host: String,
        primary_port: u16,
        #[serde(default)]
        tls_enabled: bool,
    },
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::Primary(ReplicationPrimaryConfig::default())
    }
}

/// Tunables shared by both sides of the replication link.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationTuning {
    /// Size of the replication backlog retained for partial resyncs, bytes.
    #[serde(default = "default_backlog_size")]
    pub backlog_size: usize,
    /// Replication link inactivity timeout, milliseconds.
    #[serde(default = "default_repl_timeout")]
    pub repl_timeout: u64,
    /// Per-replica output limit: a replica lagging more than this many bytes
    /// behind the primary offset is disconnected.
    #[serde(default = "default_output_buffer_limit")]
    pub output_buffer_limit: usize,
    /// Directory for snapshot temp files received during a full sync.
    #[serde(default = "default_transfer_dir")]
    pub transfer_dir: String,
    /// On the replica, parse diskless snapshots straight off the socket
    /// instead of spooling them to disk first.
    #[serde(default)]
    pub diskless_load: bool,
}

impl Default for ReplicationTuning {
    fn default() -> Self {
        Self {
            backlog_size: default_backlog_size(),
            repl_timeout: default_repl_timeout(),
            output_buffer_limit: default_output_buffer_limit(),
            transfer_dir: default_transfer_dir(),
            diskless_load: false,
        }
    }
}

fn default_backlog_size() -> usize {
    1024 * 1024 // 1MB
}
fn default_repl_timeout() -> u64 {
    60_000
}
fn default_output_buffer_limit() -> usize {
    256 * 1024 * 1024 // 256MB
}
fn default_transfer_dir() -> String {
    "quartzkv_data".to_string()
}

/// Represents the final, validated, and resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub log_level: String,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub repl_tuning: ReplicationTuning,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            log_level: default_log_level(),
            replication: ReplicationConfig::default(),
            repl_tuning: ReplicationTuning::default(),
            cluster: ClusterConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7450
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(&contents, config::FileFormat::Toml))
            .build()
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in '{path}'"))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.repl_tuning.backlog_size == 0 {
            return Err(anyhow!("repl_tuning.backlog_size cannot be 0"));
        }
        if self.cluster.enabled {
            let bus = u32::from(self.port) + u32::from(self.cluster.bus_port_offset);
            if bus > u32::from(u16::MAX) {
                return Err(anyhow!(
                    "cluster bus port ({bus}) exceeds the valid range (max 65535); check 'port' and 'bus_port_offset'"
                ));
            }
        }
        if self.tls.enabled && (self.tls.cert_path.is_empty() || self.tls.key_path.is_empty()) {
            return Err(anyhow!("tls.enabled requires cert_path and key_path"));
        }
        Ok(())
    }

    /// The cluster bus port derived from the client port, unless announced
    /// explicitly.
    pub fn bus_port(&self) -> u16 {
        self.cluster
            .announce_bus_port
            .unwrap_or(self.port.wrapping_add(self.cluster.bus_port_offset))
    }

    /// Whether this instance currently runs as a replication primary.
    pub fn is_primary(&self) -> bool {
        matches!(self.replication, ReplicationConfig::Primary(_))
    }
}
