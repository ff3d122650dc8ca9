// src/core/cluster/persistence.rs

//! Serialization of the node table and epochs to the on-disk cluster
//! configuration file (`nodes.conf`), written atomically and guarded by an
//! exclusive advisory lock so two instances can never share one file.
//!
//! Format, one node per line:
//!
//! `<id> <ip>:<port>@<busport>[,hostname][,key=val]* <flags> <primary|-> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot-spec>*`
//!
//! followed by a trailing `vars current_epoch <n> last_vote_epoch <n>` line.
//! A slot-spec is `N`, `N-M`, or a `[N->-id]` / `[N-<-id]` migration marker.

use crate::core::QuartzError;
use crate::core::cluster::node::{ClusterNode, NODE_ID_LEN, NodeFlags, NodeRuntime};
use crate::core::cluster::slot::{NUM_SLOTS, format_slot_ranges};
use crate::core::cluster::state::ClusterState;
use crate::core::now_ms;
use crate::config::Config;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Opens (creating if needed) the config file and takes a non-blocking
/// exclusive advisory lock on it, held for the process lifetime. A second
/// instance pointed at the same file fails fast here.
pub fn lock_config_file(path: &str) -> Result<File, QuartzError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| QuartzError::Config(format!("cannot open cluster config '{path}': {e}")))?;

    // SAFETY: flock on an fd we own; no memory is involved.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(QuartzError::Config(format!(
            "cluster config '{path}' is locked by another running instance"
        )));
    }
    Ok(file)
}

/// Renders one `nodes.conf` line for a node.
fn format_node_line(state: &ClusterState, runtime: &NodeRuntime) -> String {
    let node = &runtime.info;
    let mut addr = format!("{}:{}@{}", node.ip, node.port, node.bus_port);
    if !node.hostname.is_empty() {
        addr.push(',');
        addr.push_str(&node.hostname);
    }
    if !node.shard_id.is_empty() {
        addr.push_str(&format!(",shard-id={}", node.shard_id));
    }
    if !node.human_name.is_empty() {
        addr.push_str(&format!(",nodename={}", node.human_name));
    }
    if node.tls_port != 0 {
        addr.push_str(&format!(",tls-port={}", node.tls_port));
    }
    if let Some(ip) = node.client_ipv4 {
        addr.push_str(&format!(",client-ipv4={ip}"));
    }
    if let Some(ip) = node.client_ipv6 {
        addr.push_str(&format!(",client-ipv6={ip}"));
    }

    let mut line = format!(
        "{} {} {} {} {} {} {} {}",
        node.id,
        addr,
        node.flags.config_string(),
        node.replica_of.as_deref().unwrap_or("-"),
        runtime.ping_sent,
        runtime.pong_received,
        node.config_epoch,
        if runtime.link.is_some() || node.is_myself() {
            "connected"
        } else {
            "disconnected"
        },
    );

    for range in format_slot_ranges(&node.slots) {
        line.push(' ');
        line.push_str(&range);
    }

    // Migration markers are local state; they only appear on our own line.
    if node.is_myself() {
        for entry in state.migrating_to.iter() {
            line.push_str(&format!(" [{}->-{}]", entry.key(), entry.value()));
        }
        for entry in state.importing_from.iter() {
            line.push_str(&format!(" [{}-<-{}]", entry.key(), entry.value()));
        }
    }
    line
}

/// Generates the full config description in memory, including the `vars`
/// trailer.
pub fn serialize(state: &ClusterState) -> String {
    let mut out = String::new();
    for entry in state.registry.nodes.iter() {
        out.push_str(&format_node_line(state, entry.value()));
        out.push('\n');
    }
    out.push_str(&format!(
        "vars current_epoch {} last_vote_epoch {}\n",
        state.current_epoch.load(Ordering::Acquire),
        state.last_vote_epoch.load(Ordering::Acquire),
    ));
    out
}

/// Saves the cluster configuration atomically: full rewrite into a temp file
/// next to the target, optional fsync, rename over the live file, fsync of
/// the directory. The live file is never truncated in place.
pub fn save_config(state: &ClusterState, do_fsync: bool) -> Result<(), QuartzError> {
    let content = serialize(state);
    let path = &state.config_file_path;
    let tmp_path = format!("{}.tmp-{}-{}", path, std::process::id(), now_ms());

    let mut tmp = File::create(&tmp_path)
        .map_err(|e| QuartzError::Config(format!("cannot create '{tmp_path}': {e}")))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| QuartzError::Config(format!("cannot write '{tmp_path}': {e}")))?;
    if do_fsync {
        tmp.sync_all()
            .map_err(|e| QuartzError::Config(format!("fsync of '{tmp_path}' failed: {e}")))?;
    }
    drop(tmp);

    std::fs::rename(&tmp_path, path)
        .map_err(|e| QuartzError::Config(format!("cannot rename '{tmp_path}': {e}")))?;

    if do_fsync
        && let Some(dir) = Path::new(path).parent()
    {
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        if let Ok(dir_file) = File::open(dir) {
            dir_file.sync_all().ok();
        }
    }
    Ok(())
}

/// Parses a persisted configuration into a fresh `ClusterState`. Any parse
/// failure is fatal: a corrupt config must stop startup rather than let the
/// node rejoin with amnesia.
pub fn load_from_file(path: &str, config: &Config) -> Result<ClusterState, QuartzError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| QuartzError::Config(format!("cannot read cluster config '{path}': {e}")))?;

    let mut nodes: Vec<(NodeRuntime, Vec<SlotSpec>)> = Vec::new();
    let mut current_epoch = 0u64;
    let mut last_vote_epoch = 0u64;

    for (lineno, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(vars) = line.strip_prefix("vars ") {
            let tokens: Vec<&str> = vars.split_whitespace().collect();
            let mut iter = tokens.chunks_exact(2);
            for pair in &mut iter {
                match pair[0] {
                    "current_epoch" => current_epoch = parse_field(pair[1], lineno)?,
                    "last_vote_epoch" => last_vote_epoch = parse_field(pair[1], lineno)?,
                    other => warn!("Ignoring unknown vars entry '{other}' in '{path}'"),
                }
            }
            continue;
        }
        nodes.push(parse_node_line(line, lineno)?);
    }

    // The line carrying the MYSELF flag seeds the state with our identity.
    let my_id = nodes
        .iter()
        .find(|(rt, _)| rt.info.is_myself())
        .map(|(rt, _)| rt.info.id.clone())
        .ok_or_else(|| {
            QuartzError::Config(format!("cluster config '{path}' has no myself line"))
        })?;

    let mut built = ClusterState::new(config)?;
    // Replace the generated identity with the persisted one.
    let generated_id = built.my_id.clone();
    built.registry.remove(&generated_id);
    built.my_id = my_id.clone();
    built.config_file_path = path.to_string();

    for (mut runtime, slot_specs) in nodes {
        if runtime.info.is_myself() {
            // Addresses are owned by the live configuration, not the file.
            ClusterState::apply_announce_config(&mut runtime.info, config);
            runtime.pong_received = now_ms();
        }
        let node_id = runtime.info.id.clone();
        let plain: Vec<(u16, u16)> = slot_specs
            .iter()
            .filter_map(|s| match s {
                SlotSpec::Range(a, b) => Some((*a, *b)),
                _ => None,
            })
            .collect();
        built.registry.insert(runtime);
        for (start, end) in plain {
            for slot in start..=end {
                built.rebind_slot(slot, &node_id);
            }
        }
        for spec in slot_specs {
            match spec {
                SlotSpec::Migrating(slot, dest) if node_id == my_id => {
                    built.migrating_to.insert(slot, dest);
                }
                SlotSpec::Importing(slot, src) if node_id == my_id => {
                    built.importing_from.insert(slot, src);
                }
                _ => {}
            }
        }
    }

    // Resolve replica lists from the persisted primary references.
    let pairs: Vec<(String, String)> = built
        .registry
        .nodes
        .iter()
        .filter_map(|e| {
            e.value()
                .info
                .replica_of
                .clone()
                .map(|primary| (e.key().clone(), primary))
        })
        .collect();
    for (replica, primary) in pairs {
        if let Some(mut rt) = built.registry.get_mut(&primary) {
            rt.info.add_replica(&replica);
            let shard = rt.info.shard_id.clone();
            drop(rt);
            built.registry.update_shard_id(&replica, &shard);
        }
    }

    built.current_epoch.store(current_epoch, Ordering::Release);
    built
        .last_vote_epoch
        .store(last_vote_epoch, Ordering::Release);

    info!(
        "Loaded cluster config from '{path}': {} nodes, epoch {}",
        built.registry.len(),
        current_epoch
    );
    Ok(built)
}

#[derive(Debug, Clone)]
enum SlotSpec {
    Range(u16, u16),
    Migrating(u16, String),
    Importing(u16, String),
}

fn parse_field<T: std::str::FromStr>(raw: &str, lineno: usize) -> Result<T, QuartzError> {
    raw.parse().map_err(|_| {
        QuartzError::Config(format!("invalid numeric field '{raw}' on line {}", lineno + 1))
    })
}

fn parse_node_line(line: &str, lineno: usize) -> Result<(NodeRuntime, Vec<SlotSpec>), QuartzError> {
    let bad = |what: &str| {
        QuartzError::Config(format!("{what} on line {} of cluster config", lineno + 1))
    };

    let mut fields = line.split_whitespace();
    let id = fields.next().ok_or_else(|| bad("missing node id"))?;
    if id.len() != NODE_ID_LEN {
        return Err(bad("node id must be 40 characters"));
    }
    let addr = fields.next().ok_or_else(|| bad("missing address"))?;
    let flags_raw = fields.next().ok_or_else(|| bad("missing flags"))?;
    let primary_raw = fields.next().ok_or_else(|| bad("missing primary id"))?;
    let ping_sent: u64 = parse_field(fields.next().ok_or_else(|| bad("missing ping-sent"))?, lineno)?;
    let pong_received: u64 =
        parse_field(fields.next().ok_or_else(|| bad("missing pong-recv"))?, lineno)?;
    let config_epoch: u64 =
        parse_field(fields.next().ok_or_else(|| bad("missing config epoch"))?, lineno)?;
    let _link_state = fields.next().ok_or_else(|| bad("missing link state"))?;

    let flags = NodeFlags::from_config_string(flags_raw);
    let mut node = ClusterNode::new(id.to_string(), flags);
    node.config_epoch = config_epoch;
    node.replica_of = match primary_raw {
        "-" => None,
        other if other.len() == NODE_ID_LEN => Some(other.to_string()),
        _ => return Err(bad("invalid primary id")),
    };

    // `ip:port@busport[,hostname][,key=val]*`
    let mut addr_parts = addr.split(',');
    let endpoint = addr_parts.next().ok_or_else(|| bad("empty address"))?;
    let (hostport, busport) = endpoint
        .rsplit_once('@')
        .ok_or_else(|| bad("address missing bus port"))?;
    let (ip, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| bad("address missing client port"))?;
    node.ip = ip.to_string();
    node.port = parse_field(port, lineno)?;
    node.bus_port = parse_field(busport, lineno)?;
    // Generated shard ids are placeholders until an aux field overrides them.
    node.shard_id = String::new();
    for aux in addr_parts {
        match aux.split_once('=') {
            Some(("shard-id", v)) => node.shard_id = v.to_string(),
            Some(("nodename", v)) => node.human_name = v.to_string(),
            Some(("tls-port", v)) => node.tls_port = parse_field(v, lineno)?,
            Some(("client-ipv4", v)) => node.client_ipv4 = v.parse().ok(),
            Some(("client-ipv6", v)) => node.client_ipv6 = v.parse().ok(),
            Some((key, _)) => warn!("Ignoring unknown aux field '{key}' in cluster config"),
            None => node.hostname = aux.to_string(),
        }
    }
    if node.shard_id.is_empty() {
        node.shard_id = crate::core::random_hex_id();
    }

    let mut specs = Vec::new();
    for token in fields {
        if let Some(marker) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if let Some((slot, dest)) = marker.split_once("->-") {
                specs.push(SlotSpec::Migrating(
                    parse_slot(slot, lineno)?,
                    dest.to_string(),
                ));
            } else if let Some((slot, src)) = marker.split_once("-<-") {
                specs.push(SlotSpec::Importing(
                    parse_slot(slot, lineno)?,
                    src.to_string(),
                ));
            } else {
                return Err(bad("invalid slot migration marker"));
            }
        } else if let Some((start, end)) = token.split_once('-') {
            let start = parse_slot(start, lineno)?;
            let end = parse_slot(end, lineno)?;
            if start > end {
                return Err(bad("inverted slot range"));
            }
            specs.push(SlotSpec::Range(start, end));
        } else {
            let slot = parse_slot(token, lineno)?;
            specs.push(SlotSpec::Range(slot, slot));
        }
    }

    let mut runtime = NodeRuntime::new(node);
    runtime.ping_sent = ping_sent;
    runtime.pong_received = pong_received;
    Ok((runtime, specs))
}

fn parse_slot(raw: &str, lineno: usize) -> Result<u16, QuartzError> {
    let slot: u16 = parse_field(raw, lineno)?;
    if (slot as usize) >= NUM_SLOTS {
        return Err(QuartzError::Config(format!(
            "slot {slot} out of range on line {}",
            lineno + 1
        )));
    }
    Ok(slot)
}
