//! Outbound connection establishment.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream, UdpSocket};

use crate::error::{RelayError, Result};
use crate::logger::log;
use crate::utils::with_deadline;

/// Opens outbound connections to validated targets
#[derive(Debug, Clone, Copy, Default)]
pub struct Dialer {
    /// Deadline for the whole dial (resolution included); `None` waits forever
    pub connect_timeout: Option<Duration>,
    /// Set TCP_NODELAY on outbound TCP connections
    pub tcp_nodelay: bool,
}

impl Dialer {
    pub fn new(connect_timeout: Option<Duration>, tcp_nodelay: bool) -> Self {
        Self {
            connect_timeout,
            tcp_nodelay,
        }
    }

    /// Connect a TCP stream to `host:port`
    pub async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let target = display_target(host, port);
        let stream = with_deadline(self.connect_timeout, "TCP connect", async {
            TcpStream::connect((host, port))
                .await
                .map_err(|source| RelayError::Dial {
                    target: target.clone(),
                    source,
                })
        })
        .await?;

        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        log::debug!(target = %target, "Connected to remote (tcp)");
        Ok(stream)
    }

    /// Bind a UDP socket and connect it to `host:port`
    pub async fn dial_udp(&self, host: &str, port: u16) -> Result<UdpSocket> {
        let target = display_target(host, port);
        let dial_err = |source: io::Error| RelayError::Dial {
            target: target.clone(),
            source,
        };

        with_deadline(self.connect_timeout, "UDP connect", async {
            let remote = lookup_host((host, port))
                .await
                .map_err(dial_err)?
                .next()
                .ok_or_else(|| {
                    dial_err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses found for {}", host),
                    ))
                })?;

            let socket = UdpSocket::bind(unspecified_for(&remote))
                .await
                .map_err(dial_err)?;
            socket.connect(remote).await.map_err(dial_err)?;
            log::debug!(target = %target, remote = %remote, "Connected to remote (udp)");
            Ok(socket)
        })
        .await
    }
}

/// `host:port`, bracketing IPv6 literals
fn display_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Wildcard local address of the same family as `remote`
fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}
