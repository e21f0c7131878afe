//! Connection handling logic
//!
//! One accepted, source-admitted connection: read the header, apply the target
//! policy and destination gate, then relay over TCP or tunnel UDP.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::core::{read_header, relay_duplex, split_host_port, RelayHeader, Server, Transport};
use crate::error::{RelayError, Result};
use crate::logger::log;
use crate::utils::with_deadline;

/// Process a single connection
///
/// Returns once the session is over. Every error closes the client without a
/// response; nothing is written back on rejection.
pub async fn process_connection<S>(server: &Server, stream: S, peer: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_config = server.conn_config;

    // Bytes the client sent past the header stay in this buffer and are
    // forwarded to the target first.
    let mut stream = BufReader::new(stream);

    let header = with_deadline(conn_config.header_timeout, "header read", async {
        read_header(&mut stream, conn_config.max_header_size)
            .await
            .map_err(RelayError::from)
    })
    .await?;

    let RelayHeader { transport, target } = header;
    log::debug!(peer = %peer, transport = %transport, target = %target, "Header received");

    let target_policy = server.target_policy.load();
    if let Some(rule) = target_policy.violated_rule(&target) {
        log::debug!(peer = %peer, target = %target, rule = %rule, "Target forbidden by policy");
        return Err(RelayError::ForbiddenTarget {
            rule: rule.to_string(),
            target,
        });
    }

    let (host, port) =
        split_host_port(&target).ok_or_else(|| RelayError::InvalidTarget(target.clone()))?;

    if server.destination_gate.is_destination_blocked(&host).await {
        log::info!(peer = %peer, host = %host, "Destination host is blocked");
        return Err(RelayError::BlockedDestination(host));
    }

    match transport {
        Transport::Tcp => handle_tcp(server, stream, &host, port, peer).await,
        Transport::Udp => handle_udp(server, stream, &host, port, peer).await,
    }
}

async fn handle_tcp<S>(
    server: &Server,
    client_stream: BufReader<S>,
    host: &str,
    port: u16,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_stream = server.dialer().dial_tcp(host, port).await?;

    log::debug!(peer = %peer, host = %host, port = port, "Relaying TCP");
    let result = relay_duplex(
        client_stream,
        remote_stream,
        server.relay_options(),
        &server.shutdown,
    )
    .await;

    log::debug!(
        peer = %peer,
        host = %host,
        port = port,
        upstream = result.upstream,
        downstream = result.downstream,
        end = ?result.end,
        "TCP relay finished"
    );
    Ok(())
}

async fn handle_udp<S>(
    server: &Server,
    client_stream: BufReader<S>,
    host: &str,
    port: u16,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    log::debug!(peer = %peer, host = %host, port = port, "Starting UDP tunnel");
    let stats = server
        .udp_tunnel()
        .relay_udp_over_tcp(client_stream, host, port, &server.shutdown)
        .await?;

    log::debug!(
        peer = %peer,
        host = %host,
        port = port,
        upstream = stats.upstream,
        downstream = stats.downstream,
        "UDP tunnel finished"
    );
    Ok(())
}
