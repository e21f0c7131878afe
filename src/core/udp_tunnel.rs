//! UDP over the accepted TCP stream
//!
//! Frame format, identical in both directions:
//!
//! ```text
//! +----------------+-------------------+
//! | length (u16 BE)| payload (length)  |
//! +----------------+-------------------+
//! ```
//!
//! Every frame the client sends becomes one datagram to the target, and every
//! datagram the target sends back becomes one frame on the stream. A zero
//! length frame is an empty datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dialer::Dialer;
use crate::error::Result;
use crate::logger::log;

/// Bytes of length prefix before every payload
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a frame can carry
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Initial stream read buffer
const READ_CHUNK: usize = 8 * 1024;

/// Length-prefixed datagram framing
pub struct UdpFrame;

impl UdpFrame {
    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `None` and leaves `buf` untouched when the frame is incomplete.
    pub fn decode(buf: &mut BytesMut) -> Option<Bytes> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < FRAME_HEADER_LEN + len {
            return None;
        }
        buf.advance(FRAME_HEADER_LEN);
        Some(buf.split_to(len).freeze())
    }

    /// Append a frame carrying `payload` to `out`.
    ///
    /// Payloads longer than [`MAX_DATAGRAM_SIZE`] are truncated; a UDP socket
    /// never hands back more than that.
    pub fn encode(payload: &[u8], out: &mut BytesMut) {
        let payload = &payload[..payload.len().min(MAX_DATAGRAM_SIZE)];
        out.reserve(FRAME_HEADER_LEN + payload.len());
        out.put_u16(payload.len() as u16);
        out.put_slice(payload);
    }
}

/// Byte counts of a finished tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Payload bytes sent to the target
    pub upstream: u64,
    /// Payload bytes received from the target
    pub downstream: u64,
}

/// Relays framed datagrams between a client stream and one UDP target
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTunnel {
    dialer: Dialer,
    idle_timeout: Option<Duration>,
}

impl UdpTunnel {
    pub fn new(dialer: Dialer, idle_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            idle_timeout,
        }
    }

    /// Dial `host:port` over UDP and relay until the client stream ends.
    pub async fn relay_udp_over_tcp<S>(
        &self,
        stream: S,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let socket = self.dialer.dial_udp(host, port).await?;
        self.run(stream, socket, cancel).await
    }

    async fn run<S>(
        &self,
        mut stream: S,
        socket: UdpSocket,
        cancel: &CancellationToken,
    ) -> Result<TunnelStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stats = TunnelStats::default();
        let mut pending = BytesMut::with_capacity(READ_CHUNK);
        let mut outgoing = BytesMut::with_capacity(FRAME_HEADER_LEN + MAX_DATAGRAM_SIZE);
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let idle = tokio::time::sleep(self.idle_timeout.unwrap_or(Duration::from_secs(3600)));
        tokio::pin!(idle);

        loop {
            pending.reserve(READ_CHUNK);

            tokio::select! {
                result = stream.read_buf(&mut pending) => {
                    match result? {
                        0 => {
                            log::debug!("UDP tunnel client disconnected");
                            break;
                        }
                        _ => self.touch(idle.as_mut()),
                    }

                    while let Some(payload) = UdpFrame::decode(&mut pending) {
                        match socket.send(&payload).await {
                            Ok(n) => {
                                stats.upstream += n as u64;
                                log::trace!(bytes = n, "UDP datagram sent");
                            }
                            Err(e) => {
                                log::debug!(error = %e, "UDP send error");
                            }
                        }
                    }
                }

                result = socket.recv(&mut recv_buf) => {
                    match result {
                        Ok(n) => {
                            outgoing.clear();
                            UdpFrame::encode(&recv_buf[..n], &mut outgoing);
                            stream.write_all(&outgoing).await?;
                            stats.downstream += n as u64;
                            self.touch(idle.as_mut());
                            log::trace!(bytes = n, "UDP datagram received");
                        }
                        Err(e) => {
                            // e.g. ICMP port unreachable surfaced on a connected socket
                            log::debug!(error = %e, "UDP recv error");
                        }
                    }
                }

                _ = &mut idle, if self.idle_timeout.is_some() => {
                    log::debug!("UDP tunnel idle timeout");
                    break;
                }

                _ = cancel.cancelled() => {
                    log::debug!("UDP tunnel cancelled");
                    break;
                }
            }
        }

        Ok(stats)
    }

    fn touch(&self, idle: std::pin::Pin<&mut tokio::time::Sleep>) {
        if let Some(limit) = self.idle_timeout {
            idle.reset(Instant::now() + limit);
        }
    }
}
