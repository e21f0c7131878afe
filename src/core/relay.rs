//! Duplex byte relay between the inbound and outbound connections
//!
//! Each direction is a plain buffered copy loop. How the session ends is
//! chosen by [`RelayShutdown`]; an optional idle timeout and the server-wide
//! cancellation token can end it early.

use pin_project_lite::pin_project;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Default per-direction copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// When a relay session is considered finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RelayShutdown {
    /// Await the target-to-client direction only. The client-to-target copy
    /// runs detached and is aborted once the awaited direction finishes; an
    /// error on it ends the session too.
    #[default]
    Primary,
    /// Await both directions, propagating each EOF as a half-close. An I/O
    /// error in either direction ends the session at once.
    Both,
}

impl fmt::Display for RelayShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayShutdown::Primary => write!(f, "primary"),
            RelayShutdown::Both => write!(f, "both"),
        }
    }
}

/// Relay tuning
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub shutdown: RelayShutdown,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            shutdown: RelayShutdown::default(),
        }
    }
}

/// How a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The copy loops finished on their own (EOF or I/O error)
    Completed,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
    /// Server shutdown
    Cancelled,
}

/// Result of a relay session
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes read from the client (client -> target)
    pub upstream: u64,
    /// Bytes read from the target (target -> client)
    pub downstream: u64,
    pub end: RelayEnd,
}

pin_project! {
    /// A stream wrapper that tracks the last activity time and bytes read
    pub(crate) struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        // Milliseconds since `start_time` of the last read or write
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    pub(crate) fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes,
        }
    }
}

fn elapsed_millis(start_time: &Instant) -> u64 {
    start_time.elapsed().as_millis() as u64
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.last_activity
                    .store(elapsed_millis(this.start_time), Ordering::Release);
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.last_activity
                    .store(elapsed_millis(this.start_time), Ordering::Release);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Copy `reader` into `writer` until EOF or error.
///
/// On EOF `writer` is shut down so the other side sees a half-close. Errors
/// are logged and returned to the caller, which ends the session.
async fn copy_direction<R, W>(
    reader: R,
    mut writer: W,
    buffer_size: usize,
    direction: &'static str,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(buffer_size, reader);
    match tokio::io::copy_buf(&mut reader, &mut writer).await {
        Ok(n) => {
            let _ = writer.shutdown().await;
            Ok(n)
        }
        Err(e) => {
            log::debug!(direction = direction, error = %e, "Relay copy ended with error");
            Err(e)
        }
    }
}

/// Resolves once no activity has been seen for `idle_timeout`; never if unset
async fn idle_watch(idle_timeout: Option<Duration>, start_time: Instant, last_activity: &AtomicU64) {
    let Some(limit) = idle_timeout else {
        return std::future::pending().await;
    };
    let limit_ms = limit.as_millis() as u64;
    let period = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));

    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let idle = elapsed_millis(&start_time).saturating_sub(last_activity.load(Ordering::Acquire));
        if idle >= limit_ms {
            return;
        }
    }
}

/// Relay bytes between `inbound` (client) and `outbound` (target).
///
/// Both connections are dropped, and therefore closed, before this returns.
pub async fn relay_duplex<A, B>(
    inbound: A,
    outbound: B,
    options: RelayOptions,
    cancel: &CancellationToken,
) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let upstream = Arc::new(AtomicU64::new(0));
    let downstream = Arc::new(AtomicU64::new(0));

    let inbound = TimedStream::new(
        inbound,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&upstream),
    );
    let outbound = TimedStream::new(
        outbound,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&downstream),
    );

    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (outbound_read, outbound_write) = tokio::io::split(outbound);
    let buffer_size = options.buffer_size;

    let transfer = async move {
        match options.shutdown {
            RelayShutdown::Primary => {
                let mut upload = tokio::spawn(copy_direction(
                    inbound_read,
                    outbound_write,
                    buffer_size,
                    "upstream",
                ));
                // Abort the detached direction however this future ends
                let _abort = scopeguard::guard(upload.abort_handle(), |handle| handle.abort());
                // Client EOF leaves the session open; a client error ends it
                tokio::select! {
                    _ = copy_direction(outbound_read, inbound_write, buffer_size, "downstream") => {}
                    Ok(Err(_)) = &mut upload => {}
                }
            }
            RelayShutdown::Both => {
                // The first error in either direction ends the session
                let _ = tokio::try_join!(
                    copy_direction(inbound_read, outbound_write, buffer_size, "upstream"),
                    copy_direction(outbound_read, inbound_write, buffer_size, "downstream"),
                );
            }
        }
    };

    let end = tokio::select! {
        _ = transfer => RelayEnd::Completed,
        _ = idle_watch(options.idle_timeout, start_time, &last_activity) => RelayEnd::IdleTimeout,
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    };

    CopyResult {
        upstream: upstream.load(Ordering::Relaxed),
        downstream: downstream.load(Ordering::Relaxed),
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn options(shutdown: RelayShutdown) -> RelayOptions {
        RelayOptions {
            buffer_size: 1024,
            idle_timeout: None,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_timed_stream_counts_reads() {
        let cursor = Cursor::new(b"hello world".to_vec());
        let last_activity = Arc::new(AtomicU64::new(0));
        let read_bytes = Arc::new(AtomicU64::new(0));
        let mut stream = TimedStream::new(
            cursor,
            Instant::now(),
            Arc::clone(&last_activity),
            read_bytes.clone(),
        );

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(read_bytes.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_timed_stream_write_updates_activity() {
        let start_time = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let mut stream = TimedStream::new(
            Cursor::new(Vec::new()),
            start_time,
            Arc::clone(&last_activity),
            Arc::new(AtomicU64::new(0)),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"test").await.unwrap();
        assert!(last_activity.load(Ordering::Acquire) >= 20);
    }

    #[tokio::test]
    async fn test_relay_both_round_trip() {
        let (mut client, inbound) = duplex(64);
        let (outbound, mut remote) = duplex(64);
        let cancel = CancellationToken::new();

        let relay = tokio::spawn(async move {
            relay_duplex(inbound, outbound, options(RelayShutdown::Both), &cancel).await
        });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        // Client half-closes: the target must see EOF but can still answer
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        remote.write_all(b"bye").await.unwrap();
        drop(remote);

        let mut tail = Vec::new();
        client.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"bye");

        let result = relay.await.unwrap();
        assert_eq!(result.end, RelayEnd::Completed);
        assert_eq!(result.upstream, 5);
        assert_eq!(result.downstream, 9);
    }

    #[tokio::test]
    async fn test_relay_primary_ends_when_target_closes() {
        let (mut client, inbound) = duplex(64);
        let (outbound, mut remote) = duplex(64);
        let cancel = CancellationToken::new();

        let relay = tokio::spawn(async move {
            relay_duplex(inbound, outbound, options(RelayShutdown::Primary), &cancel).await
        });

        remote.write_all(b"banner").await.unwrap();
        drop(remote);

        // Client never closes its side, the session still ends
        let result = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should end when the target closes")
            .unwrap();
        assert_eq!(result.end, RelayEnd::Completed);
        assert_eq!(result.downstream, 6);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"banner");
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client, inbound) = duplex(64);
        let (outbound, _remote) = duplex(64);
        let cancel = CancellationToken::new();
        let opts = RelayOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..options(RelayShutdown::Both)
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay_duplex(inbound, outbound, opts, &cancel),
        )
        .await
        .expect("idle session should be closed");
        assert_eq!(result.end, RelayEnd::IdleTimeout);
        assert_eq!(result.upstream, 0);
        assert_eq!(result.downstream, 0);
    }

    #[tokio::test]
    async fn test_relay_cancelled() {
        let (_client, inbound) = duplex(64);
        let (outbound, _remote) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = relay_duplex(inbound, outbound, options(RelayShutdown::Primary), &cancel).await;
        assert_eq!(result.end, RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_relay_closes_both_connections() {
        let (mut client, inbound) = duplex(64);
        let (outbound, remote) = duplex(64);
        let cancel = CancellationToken::new();

        drop(remote);
        let result = relay_duplex(inbound, outbound, options(RelayShutdown::Primary), &cancel).await;
        assert_eq!(result.end, RelayEnd::Completed);

        // Inbound end was dropped by the relay
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    /// Client whose reads fail with a reset; writes are swallowed
    struct ResetClient;

    impl AsyncRead for ResetClient {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetClient {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn assert_client_error_ends_session(shutdown: RelayShutdown) {
        let (outbound, mut remote) = duplex(64);
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            relay_duplex(ResetClient, outbound, options(shutdown), &cancel),
        )
        .await
        .expect("client error should end the session");
        assert_eq!(result.end, RelayEnd::Completed);

        // Outbound end was dropped, the target sees EOF
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), remote.read_to_end(&mut buf))
            .await
            .expect("target should see the connection close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relay_both_client_error_ends_session() {
        assert_client_error_ends_session(RelayShutdown::Both).await;
    }

    #[tokio::test]
    async fn test_relay_primary_client_error_ends_session() {
        assert_client_error_ends_session(RelayShutdown::Primary).await;
    }

    #[test]
    fn test_default_options() {
        let opts = RelayOptions::default();
        assert_eq!(opts.buffer_size, 256 * 1024);
        assert!(opts.idle_timeout.is_none());
        assert_eq!(opts.shutdown, RelayShutdown::Primary);
    }
}
