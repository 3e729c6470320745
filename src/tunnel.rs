//! Bidirectional byte relay between the two members of a [`TunnelPair`].
//!
//! Each direction runs as its own task: fill from the source into a bounded
//! buffer, then flush the whole buffer to the sink before filling again, so a
//! slow sink stops reads from a fast source. EOF on one side is propagated as
//! a half-close of the other; the opposite direction then gets a bounded drain
//! window before the pair is torn down. Any I/O error closes both members.
//! An optional idle timeout closes the pair once no bytes have moved in
//! either direction for the whole period.

use crate::connection::{Connection, ConnectionHandle, TunnelPair};
use crate::endpoint::{Endpoint, Fill};
use crate::error::ProxyError;
use crate::scheduler::Scheduler;
use bytes::BytesMut;
use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Cancelled,
}

/// Last time either pump moved bytes, shared by both directions.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

struct PumpOutcome {
    transferred: u64,
    result: io::Result<PumpEnd>,
}

struct Pump<R, W> {
    direction: &'static str,
    source: Endpoint<R>,
    source_handle: Arc<ConnectionHandle>,
    sink: Endpoint<W>,
    sink_handle: Arc<ConnectionHandle>,
    buffer: BytesMut,
    buffer_size: usize,
    activity: Arc<Activity>,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) -> PumpOutcome {
        let mut transferred = 0u64;
        let result = self.pump(&mut transferred).await;
        if let Err(e) = &result {
            debug!("{} failed after {} bytes: {}", self.direction, transferred, e);
            self.source_handle.close();
        }
        self.source.close();
        self.sink.close();
        PumpOutcome { transferred, result }
    }

    async fn pump(&mut self, transferred: &mut u64) -> io::Result<PumpEnd> {
        loop {
            // Bytes the source sent before the tunnel existed go out first.
            if !self.buffer.is_empty() {
                let pending = self.buffer.len() as u64;
                tokio::select! {
                    biased;
                    _ = self.source_handle.closed() => return Ok(PumpEnd::Cancelled),
                    _ = self.sink_handle.closed() => return Ok(PumpEnd::Cancelled),
                    flushed = self.sink.flush_all(&self.buffer) => flushed?,
                }
                self.buffer.clear();
                self.activity.touch();
                *transferred += pending;
            }

            self.buffer.reserve(self.buffer_size);
            let fill = tokio::select! {
                biased;
                _ = self.source_handle.closed() => return Ok(PumpEnd::Cancelled),
                _ = self.sink_handle.closed() => return Ok(PumpEnd::Cancelled),
                fill = self.source.fill(&mut self.buffer) => fill?,
            };

            match fill {
                Fill::Filled(_) => self.activity.touch(),
                Fill::WouldBlock => {}
                Fill::Eof => {
                    self.sink.shutdown_output().await?;
                    self.sink_handle.on_local_shutdown();
                    self.source_handle.on_remote_eof();
                    debug!("{} reached EOF after {} bytes", self.direction, transferred);
                    return Ok(PumpEnd::Eof);
                }
            }
        }
    }
}

/// Pumps bytes between paired connections without looking at them.
#[derive(Clone)]
pub struct TunnelRelay {
    scheduler: Scheduler,
    drain_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl TunnelRelay {
    pub fn new(scheduler: Scheduler, drain_timeout: Duration) -> Self {
        Self {
            scheduler,
            drain_timeout,
            idle_timeout: None,
        }
    }

    /// Closes a tunnel after `timeout` with no traffic in either direction.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Binds `client` and `origin` into a tunnel pair and relays until both
    /// directions end. Returns once both endpoints are released.
    pub async fn relay<C, O>(&self, client: Connection<C>, origin: Connection<O>) -> Result<RelayStats, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        O: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pair = TunnelPair::bind(client.handle(), origin.handle())?;
        let client_buffer_size = client.buffer_size();
        let origin_buffer_size = origin.buffer_size();

        let (client_endpoint, client_buffer, client_handle) = client.into_parts();
        let (origin_endpoint, origin_buffer, origin_handle) = origin.into_parts();
        let (client_reader, client_writer) = match client_endpoint.split() {
            Ok(halves) => halves,
            Err(e) => {
                pair.close();
                return Err(ProxyError::RelayIo(e));
            }
        };
        let (origin_reader, origin_writer) = match origin_endpoint.split() {
            Ok(halves) => halves,
            Err(e) => {
                pair.close();
                return Err(ProxyError::RelayIo(e));
            }
        };

        let activity = Arc::new(Activity::new());
        if let Some(timeout) = self.idle_timeout {
            self.scheduler.spawn(watch_idle(
                timeout,
                activity.clone(),
                client_handle.clone(),
                origin_handle.clone(),
            ));
        }

        let upstream = Pump {
            direction: "client -> origin",
            source: client_reader,
            source_handle: client_handle.clone(),
            sink: origin_writer,
            sink_handle: origin_handle.clone(),
            buffer: client_buffer,
            buffer_size: client_buffer_size,
            activity: activity.clone(),
        };
        let downstream = Pump {
            direction: "origin -> client",
            source: origin_reader,
            source_handle: origin_handle,
            sink: client_writer,
            sink_handle: client_handle,
            buffer: origin_buffer,
            buffer_size: origin_buffer_size,
            activity,
        };

        let mut upstream = self.scheduler.spawn(upstream.run());
        let mut downstream = self.scheduler.spawn(downstream.run());

        let (upstream_first, first) = tokio::select! {
            outcome = &mut upstream => (true, outcome),
            outcome = &mut downstream => (false, outcome),
        };
        let remaining: &mut JoinHandle<PumpOutcome> = if upstream_first {
            &mut downstream
        } else {
            &mut upstream
        };

        let first = flatten(first);
        let second = match &first.result {
            Ok(PumpEnd::Eof) => match tokio::time::timeout(self.drain_timeout, &mut *remaining).await {
                Ok(outcome) => flatten(outcome),
                Err(_) => {
                    warn!(
                        "Tunnel drain exceeded {:?}, closing both sides",
                        self.drain_timeout
                    );
                    pair.close();
                    flatten(remaining.await)
                }
            },
            _ => {
                pair.close();
                flatten(remaining.await)
            }
        };
        pair.close();

        let (up, down) = if upstream_first {
            (first, second)
        } else {
            (second, first)
        };
        let stats = RelayStats {
            client_to_origin: up.transferred,
            origin_to_client: down.transferred,
        };

        match (up.result, down.result) {
            (Err(e), _) | (_, Err(e)) => Err(ProxyError::RelayIo(e)),
            _ => Ok(stats),
        }
    }
}

/// Ends when either member closes; the relay always closes the pair on exit.
async fn watch_idle(
    timeout: Duration,
    activity: Arc<Activity>,
    client: Arc<ConnectionHandle>,
    origin: Arc<ConnectionHandle>,
) {
    loop {
        let idle = activity.idle_for();
        if idle >= timeout {
            warn!("Tunnel idle for {:?}, closing both sides", idle);
            client.close();
            origin.close();
            return;
        }
        tokio::select! {
            _ = client.closed() => return,
            _ = origin.closed() => return,
            _ = tokio::time::sleep(timeout - idle) => {}
        }
    }
}

fn flatten(joined: Result<PumpOutcome, tokio::task::JoinError>) -> PumpOutcome {
    joined.unwrap_or_else(|e| PumpOutcome {
        transferred: 0,
        result: Err(io::Error::other(format!("relay task failed: {}", e))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Side};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf, duplex};

    fn relay() -> TunnelRelay {
        TunnelRelay::new(Scheduler::new(), Duration::from_secs(5))
    }

    fn connection(stream: DuplexStream, side: Side) -> Connection<DuplexStream> {
        Connection::new(Endpoint::new(stream), side, 16)
    }

    #[tokio::test]
    async fn test_bytes_pass_unmodified_both_ways() {
        let (proxy_client, mut client) = duplex(4096);
        let (proxy_origin, mut origin) = duplex(4096);
        let client_conn = connection(proxy_client, Side::Client);
        let origin_conn = connection(proxy_origin, Side::Origin);
        let client_handle = client_conn.handle().clone();
        let origin_handle = origin_conn.handle().clone();

        let relay_task = tokio::spawn(async move { relay().relay(client_conn, origin_conn).await });

        // TLS-looking bytes must arrive exactly as sent.
        let hello: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        client.write_all(&hello).await.unwrap();
        let mut received = vec![0u8; hello.len()];
        origin.read_exact(&mut received).await.unwrap();
        assert_eq!(received, hello);

        origin.write_all(b"\x16\x03\x03\x00\x02ok").await.unwrap();
        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"\x16\x03\x03\x00\x02ok");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        origin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        origin.shutdown().await.unwrap();

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_origin, 1000);
        assert_eq!(stats.origin_to_client, 7);
        assert_eq!(client_handle.state(), ConnectionState::Closed);
        assert_eq!(origin_handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_flowing() {
        let (proxy_client, mut client) = duplex(64);
        let (proxy_origin, mut origin) = duplex(64);
        let relay_task = tokio::spawn(async move {
            relay()
                .relay(connection(proxy_client, Side::Client), connection(proxy_origin, Side::Origin))
                .await
        });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        origin.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        origin.write_all(b"response after half-close").await.unwrap();
        origin.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response after half-close");

        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_prebuffered_bytes_are_delivered_first() {
        let (proxy_client, mut client) = duplex(4096);
        let (proxy_origin, mut origin) = duplex(4096);

        // Bytes already read past a request head stay in the connection buffer.
        client.write_all(b"early").await.unwrap();
        let mut client_conn = connection(proxy_client, Side::Client);
        while client_conn.buffered().len() < 5 {
            client_conn.fill().await.unwrap();
        }

        let relay_task = tokio::spawn(async move {
            relay()
                .relay(client_conn, connection(proxy_origin, Side::Origin))
                .await
        });

        client.write_all(b"-late").await.unwrap();
        let mut received = [0u8; 10];
        origin.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"early-late");

        drop(client);
        drop(origin);
        let _ = relay_task.await.unwrap();
    }

    /// Stream whose reads fail immediately.
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_error_on_one_side_closes_both() {
        let (proxy_client, mut client) = duplex(64);
        let client_conn = connection(proxy_client, Side::Client);
        let client_handle = client_conn.handle().clone();
        let origin_conn = Connection::new(Endpoint::new(Broken), Side::Origin, 16);

        let result = tokio::time::timeout(Duration::from_secs(1), relay().relay(client_conn, origin_conn))
            .await
            .expect("relay must not hang after an error");
        assert!(matches!(result, Err(ProxyError::RelayIo(_))));
        assert!(client_handle.is_closed());

        // The client socket was released.
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_drain_is_bounded() {
        let (proxy_client, mut client) = duplex(64);
        let (proxy_origin, _origin) = duplex(64);
        let relay = TunnelRelay::new(Scheduler::new(), Duration::from_millis(100));

        let started = std::time::Instant::now();
        let relay_task = tokio::spawn(async move {
            relay
                .relay(connection(proxy_client, Side::Client), connection(proxy_origin, Side::Origin))
                .await
        });

        // Client half-closes; the origin never answers nor closes.
        client.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("drain must be bounded")
            .unwrap();
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_closing_a_member_externally_stops_relay() {
        let (proxy_client, _client) = duplex(64);
        let (proxy_origin, _origin) = duplex(64);
        let client_conn = connection(proxy_client, Side::Client);
        let client_handle = client_conn.handle().clone();
        let origin_conn = connection(proxy_origin, Side::Origin);
        let origin_handle = origin_conn.handle().clone();

        let relay_task = tokio::spawn(async move { relay().relay(client_conn, origin_conn).await });
        tokio::task::yield_now().await;
        client_handle.close();

        let result = tokio::time::timeout(Duration::from_secs(1), relay_task)
            .await
            .expect("relay must stop promptly")
            .unwrap();
        assert!(result.is_ok());
        assert!(origin_handle.is_closed());
    }

    #[tokio::test]
    async fn test_one_way_traffic_outlives_idle_timeout() {
        let (proxy_client, mut client) = duplex(64);
        let (proxy_origin, mut origin) = duplex(64);
        let client_conn = connection(proxy_client, Side::Client);
        let client_handle = client_conn.handle().clone();
        let relay = relay().with_idle_timeout(Some(Duration::from_millis(200)));
        let relay_task = tokio::spawn(async move {
            relay
                .relay(client_conn, connection(proxy_origin, Side::Origin))
                .await
        });

        // The origin never writes; client traffic alone keeps the tunnel up.
        for i in 0u8..10 {
            client.write_all(&[i]).await.unwrap();
            let mut byte = [0u8; 1];
            origin.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], i);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!client_handle.is_closed());

        origin.write_all(b"still up").await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"still up");

        drop(client);
        drop(origin);
        let _ = relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_tunnel_hits_idle_timeout() {
        let (proxy_client, mut client) = duplex(64);
        let (proxy_origin, _origin) = duplex(64);
        let client_conn = connection(proxy_client, Side::Client);
        let client_handle = client_conn.handle().clone();
        let origin_conn = connection(proxy_origin, Side::Origin);
        let origin_handle = origin_conn.handle().clone();
        let relay = relay().with_idle_timeout(Some(Duration::from_millis(100)));

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(2), relay.relay(client_conn, origin_conn))
            .await
            .expect("idle tunnel must be closed");
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(client_handle.is_closed());
        assert!(origin_handle.is_closed());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_slow_sink_stops_reading_source() {
        use std::sync::atomic::AtomicUsize;

        const CHUNK: usize = 256;
        const TOTAL: usize = 64 * 1024;

        let (proxy_client, mut client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(64);
        let relay_task = tokio::spawn(async move {
            relay()
                .relay(connection(proxy_client, Side::Client), connection(proxy_origin, Side::Origin))
                .await
        });

        let written = Arc::new(AtomicUsize::new(0));
        let counter = written.clone();
        let writer = tokio::spawn(async move {
            let chunk = [7u8; CHUNK];
            for _ in 0..TOTAL / CHUNK {
                client.write_all(&chunk).await.unwrap();
                counter.fetch_add(CHUNK, Ordering::SeqCst);
            }
            client
        });

        // Nobody reads the origin side yet.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stalled_at = written.load(Ordering::SeqCst);
        assert!(stalled_at < 8 * 1024, "source drained {} bytes into a stalled sink", stalled_at);

        let mut received = vec![0u8; TOTAL];
        origin.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|b| *b == 7));
        let client = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer must finish once the sink drains")
            .unwrap();
        assert_eq!(written.load(Ordering::SeqCst), TOTAL);

        drop(client);
        drop(origin);
        let _ = relay_task.await.unwrap();
    }
}
