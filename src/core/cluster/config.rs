// src/core/cluster/config.rs

//! Defines the cluster-specific configuration options.

use serde::{Deserialize, Serialize};

/// Holds all configuration settings related to cluster mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// If `true`, the server will start in cluster mode.
    #[serde(default)]
    pub enabled: bool,
    /// The path to the cluster configuration file (e.g., `nodes.conf`).
    #[serde(default = "default_config_file")]
    pub config_file: String,
    /// The timeout in milliseconds after which a node is considered to be in a
    /// PFAIL (Possible Failure) state if no PONG is received.
    #[serde(default = "default_node_timeout")]
    pub node_timeout: u64,
    /// How often idle peers are pinged, milliseconds. 0 derives the interval
    /// from `node_timeout / 2`.
    #[serde(default)]
    pub ping_interval: u64,
    /// An optional IP address to announce to other nodes in the cluster.
    pub announce_ip: Option<String>,
    /// An optional port to announce for client connections.
    pub announce_port: Option<u16>,
    /// An optional TLS port to announce for client connections.
    pub announce_tls_port: Option<u16>,
    /// An optional port to announce for the cluster bus communication.
    pub announce_bus_port: Option<u16>,
    /// The port offset for the cluster bus.
    /// The final bus port will be client_port + bus_port_offset.
    #[serde(default = "default_bus_port_offset")]
    pub bus_port_offset: u16,
    /// An optional hostname gossiped to peers as a ping extension.
    pub announce_hostname: Option<String>,
    /// An optional human-readable node name gossiped to peers.
    pub human_nodename: Option<String>,
    /// Announced client-facing IPv4/IPv6, gossiped as ping extensions.
    pub announce_client_ipv4: Option<String>,
    pub announce_client_ipv6: Option<String>,
    /// Replicas whose data is older than
    /// `ping_interval + node_timeout * replica_validity_factor` refuse to
    /// start an automatic failover.
    #[serde(default = "default_replica_validity_factor")]
    pub replica_validity_factor: u64,
    /// A replica migrates to an orphaned primary only if its own primary
    /// retains more than this many healthy replicas.
    #[serde(default = "default_migration_barrier")]
    pub migration_barrier: usize,
    /// Whether replicas may migrate to orphaned primaries at all, and whether
    /// a cross-shard slot takeover may drag this node along as a replica.
    #[serde(default = "default_true")]
    pub allow_replica_migration: bool,
    /// If set, this node never starts an automatic failover.
    #[serde(default)]
    pub replica_no_failover: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_file: "nodes.conf".to_string(),
            node_timeout: 15000,
            ping_interval: 0,
            announce_ip: None,
            announce_port: None,
            announce_tls_port: None,
            announce_bus_port: None,
            bus_port_offset: 10000,
            announce_hostname: None,
            human_nodename: None,
            announce_client_ipv4: None,
            announce_client_ipv6: None,
            replica_validity_factor: default_replica_validity_factor(),
            migration_barrier: default_migration_barrier(),
            allow_replica_migration: true,
            replica_no_failover: false,
        }
    }
}

impl ClusterConfig {
    /// The effective ping cadence: explicit interval, or half the node timeout.
    pub fn effective_ping_interval(&self) -> u64 {
        if self.ping_interval > 0 {
            self.ping_interval
        } else {
            self.node_timeout / 2
        }
    }
}

fn default_config_file() -> String {
    "nodes.conf".to_string()
}
fn default_node_timeout() -> u64 {
    15000
}
fn default_bus_port_offset() -> u16 {
    10000
}
fn default_replica_validity_factor() -> u64 {
    10
}
fn default_migration_barrier() -> usize {
    1
}
fn default_true() -> bool {
    true
}
