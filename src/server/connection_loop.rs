// src/server/connection_loop.rs

//! The main accept loop for the replication surface, plus graceful shutdown
//! on the usual signals.

use super::context::ServerContext;
use super::stream::AnyStream;
use crate::core::replication::handler;
use tracing::{info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system.
/// On Unix, it listens for SIGINT and SIGTERM.
/// On Windows, it listens for Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// Accepts replication-surface connections until shutdown.
pub async fn run(ctx: ServerContext) {
    let ServerContext {
        state,
        listener,
        acceptor,
    } = ctx;

    loop {
        tokio::select! {
            _ = await_shutdown_signal() => {
                info!("Shutting down.");
                let _ = state.shutdown_tx.send(());
                // Give in-flight tasks a moment to observe the signal.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                return;
            }
            accepted = listener.accept() => {
                let (tcp_stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                };
                tcp_stream.set_nodelay(true).ok();
                let state = state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let stream = match acceptor {
                        Some(acceptor) => match acceptor.accept(tcp_stream).await {
                            Ok(tls) => AnyStream::Tls(Box::new(tls)),
                            Err(e) => {
                                warn!("TLS handshake with {addr} failed: {e}");
                                return;
                            }
                        },
                        None => AnyStream::Tcp(tcp_stream),
                    };
                    let shutdown_rx = state.shutdown_tx.subscribe();
                    handler::handle_connection(state, addr, stream, shutdown_rx).await;
                });
            }
        }
    }
}
