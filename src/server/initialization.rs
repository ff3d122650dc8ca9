// src/server/initialization.rs

//! Handles the complete server initialization process: state setup, the
//! cluster config lock, TLS, and the replication-surface listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::engine::{KeyspaceEngine, PubSubBridge, SnapshotProvider};
use crate::core::state::ServerState;
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};

/// Initializes all server components before starting the main loop.
pub async fn setup(
    config: Config,
    engine: Arc<dyn KeyspaceEngine>,
    pubsub: Arc<dyn PubSubBridge>,
    snapshots: Arc<dyn SnapshotProvider>,
) -> Result<ServerContext> {
    log_startup_info(&config);

    let acceptor = setup_tls(&config)?;

    let state = ServerState::initialize(config, engine, pubsub, snapshots)
        .map_err(|e| anyhow!("server state initialization failed: {e}"))?;
    info!("Server state initialized.");

    if let Some(cluster) = &state.cluster {
        info!("Server starting in CLUSTER mode. Node ID: {}", cluster.my_id);
        warn!("Ensure all cluster nodes have their system clocks synchronized using NTP.");
    } else {
        info!("Server starting in STANDALONE mode.");
    }

    let listener = {
        let config = state.config.lock().await;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        info!(
            "QuartzKV replication surface listening on {}:{}",
            config.host, config.port
        );
        listener
    };

    Ok(ServerContext {
        state,
        listener,
        acceptor,
    })
}

fn log_startup_info(config: &Config) {
    info!(
        "QuartzKV {} starting (port {}, cluster {})",
        env!("CARGO_PKG_VERSION"),
        config.port,
        if config.cluster.enabled { "on" } else { "off" },
    );
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    info!("TLS is enabled. Loading certificate and key.");
    let certs = load_certs(&config.tls.cert_path)?;
    let key = load_key(&config.tls.key_path)?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in '{}'", path))
}
