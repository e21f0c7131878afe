//! Server startup and accept loop
//!
//! This module binds the listener and runs the accept loop. The source gate
//! runs inline for every accepted connection; admitted connections get their
//! own task.

use crate::config::AcceptErrorPolicy;
use crate::core::Server;
use crate::handler::process_connection;
use crate::logger::log;

use anyhow::{anyhow, Context, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// TCP keepalive interval for accepted connections.
/// Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind a TCP listener with SO_REUSEADDR and the given backlog.
///
/// `addr` is `host:port`; a host name is resolved and the first address used.
pub async fn bind_listener(addr: &str, backlog: i32) -> Result<TcpListener> {
    let socket_addr: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Invalid listen address: {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("Invalid listen address: {} resolved to nothing", addr))?;
    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&socket_addr.into())
        .with_context(|| format!("Failed to bind {}", socket_addr))?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Bind `addr` and run the accept loop until shutdown
pub async fn run_server(server: Arc<Server>, addr: &str) -> Result<()> {
    let listener = bind_listener(addr, server.conn_config.tcp_backlog).await?;
    run_with_listener(server, listener).await
}

/// Run the accept loop on an already bound listener.
///
/// Returns `Ok` when the server's shutdown token is cancelled, or `Err` on an
/// accept failure under [`AcceptErrorPolicy::Exit`].
pub async fn run_with_listener(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        relay_shutdown = %server.conn_config.relay_shutdown,
        "Server started"
    );

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = server.shutdown.cancelled() => {
                log::info!("Shutdown requested, accept loop stopped");
                return Ok(());
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                let peer_addr = peer.to_string();
                log::connection(&peer_addr, "new");

                if !server.source_gate.is_peer_allowed(peer) {
                    log::source_admission(&peer_addr, false);
                    drop(stream);
                    continue;
                }
                log::source_admission(&peer_addr, true);

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    tune_accepted(&stream, server.conn_config.tcp_nodelay);

                    if let Err(e) = process_connection(&server, stream, peer).await {
                        if e.is_admission() {
                            log::debug!(peer = %peer_addr, error = %e, "Request rejected");
                        } else {
                            log::warn!(peer = %peer_addr, error = %e, "Connection error");
                        }
                    }
                    log::connection(&peer_addr, "closed");
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                match server.conn_config.on_accept_error {
                    AcceptErrorPolicy::Exit => {
                        return Err(anyhow!("Failed to accept connection: {}", e));
                    }
                    AcceptErrorPolicy::Continue => {
                        // Back off briefly so fd exhaustion does not spin the loop
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

/// Socket options for an accepted client connection
fn tune_accepted(stream: &TcpStream, tcp_nodelay: bool) {
    if tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }

    // Detect dead peers (mobile disconnect, network change, etc.)
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}
