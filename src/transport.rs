//! Client transport used by the forwarding proxy.
//!
//! The contract is acquire, send, release. [`PooledTransport`] keeps idle
//! HTTP/1 connections per origin and hands them back out while they are
//! still fresh; the pool lock is only held for map operations.

use crate::common::{ProxyBody, TlsConfig};
use crate::config::Config;
use crate::error::ProxyError;
use crate::request::{Origin, OriginScheme};
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, trace};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

type ClientBuilder = http1::Builder;

#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    type Handle: Send + 'static;

    async fn acquire(&self, origin: &Origin) -> Result<Self::Handle, ProxyError>;

    /// Sends `request` and resolves once the response head arrives. The body
    /// streams from the returned response.
    async fn send(&self, handle: &mut Self::Handle, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError>;

    /// Returns the handle once its exchange is done with it.
    fn release(&self, handle: Self::Handle);
}

pub struct PooledConnection {
    origin: Origin,
    sender: SendRequest<ProxyBody>,
    reused: bool,
}

impl PooledConnection {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

struct IdleConnection {
    sender: SendRequest<ProxyBody>,
    idle_since: Instant,
}

#[derive(Clone)]
pub struct PooledTransport {
    scheduler: Scheduler,
    connect_timeout: Duration,
    idle_timeout: Duration,
    pool_enabled: bool,
    max_idle_per_host: usize,
    tls: TlsConnector,
    idle: Arc<Mutex<HashMap<Origin, Vec<IdleConnection>>>>,
}

impl PooledTransport {
    pub fn new(scheduler: Scheduler, connect_timeout: Duration) -> Self {
        Self {
            scheduler,
            connect_timeout,
            idle_timeout: Duration::from_secs(crate::config::DEFAULT_IDLE_TIMEOUT_SECS),
            pool_enabled: true,
            max_idle_per_host: crate::config::DEFAULT_POOL_MAX_IDLE_PER_HOST,
            tls: TlsConnector::from(TlsConfig::origin_client_config()),
            idle: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config, scheduler: Scheduler) -> Self {
        Self::new(scheduler, config.connect_timeout())
            .with_pool(config.pool_enabled(), config.pool_max_idle_per_host())
            .with_idle_timeout(config.idle_timeout())
    }

    pub fn with_pool(mut self, enabled: bool, max_idle_per_host: usize) -> Self {
        self.pool_enabled = enabled && max_idle_per_host > 0;
        self.max_idle_per_host = max_idle_per_host;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn is_pool_enabled(&self) -> bool {
        self.pool_enabled
    }

    pub fn idle_connections(&self, origin: &Origin) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.get(origin).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn take_idle(&self, origin: &Origin) -> Option<SendRequest<ProxyBody>> {
        let mut idle = self.idle.lock().ok()?;
        let entries = idle.get_mut(origin)?;
        let mut found = None;
        while let Some(entry) = entries.pop() {
            if entry.idle_since.elapsed() < self.idle_timeout && entry.sender.is_ready() {
                found = Some(entry.sender);
                break;
            }
            trace!("Dropping stale pooled connection to {}", origin);
        }
        if entries.is_empty() {
            idle.remove(origin);
        }
        found
    }

    async fn connect(&self, origin: &Origin) -> Result<SendRequest<ProxyBody>, ProxyError> {
        let target = origin.to_string();
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((origin.resolver_host(), origin.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProxyError::ConnectRefused { target, source: e }),
            Err(_) => {
                return Err(ProxyError::ConnectTimeout {
                    target,
                    timeout: self.connect_timeout,
                });
            }
        };
        stream.set_nodelay(true)?;

        match origin.scheme {
            OriginScheme::Http => self.handshake(origin, stream).await,
            OriginScheme::Https => {
                let server_name = ServerName::try_from(origin.resolver_host().to_string())
                    .map_err(|e| ProxyError::OriginUnavailable(format!("Invalid server name {}: {}", origin.host, e)))?;
                let tls_stream = self
                    .tls
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ProxyError::OriginUnavailable(format!("TLS handshake with {} failed: {}", origin, e)))?;
                self.handshake(origin, tls_stream).await
            }
        }
    }

    async fn handshake<I>(&self, origin: &Origin, io: I) -> Result<SendRequest<ProxyBody>, ProxyError>
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, conn) = ClientBuilder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::OriginUnavailable(format!("Handshake with {} failed: {}", origin, e)))?;

        let origin = origin.clone();
        self.scheduler.spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection to {} ended: {}", origin, e);
            }
        });
        Ok(sender)
    }
}

#[async_trait]
impl ClientTransport for PooledTransport {
    type Handle = PooledConnection;

    async fn acquire(&self, origin: &Origin) -> Result<PooledConnection, ProxyError> {
        if self.pool_enabled {
            if let Some(sender) = self.take_idle(origin) {
                trace!("Reusing pooled connection to {}", origin);
                return Ok(PooledConnection {
                    origin: origin.clone(),
                    sender,
                    reused: true,
                });
            }
        }

        let sender = self.connect(origin).await?;
        Ok(PooledConnection {
            origin: origin.clone(),
            sender,
            reused: false,
        })
    }

    async fn send(&self, handle: &mut PooledConnection, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        handle
            .sender
            .ready()
            .await
            .map_err(|e| ProxyError::OriginUnavailable(format!("{}: {}", handle.origin, e)))?;
        let response = handle
            .sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::OriginUnavailable(format!("{}: {}", handle.origin, e)))?;
        Ok(response.map(|body| body.boxed()))
    }

    fn release(&self, handle: PooledConnection) {
        if !self.pool_enabled {
            return;
        }

        // The sender becomes ready again once the response body is fully read.
        let idle = self.idle.clone();
        let idle_timeout = self.idle_timeout;
        let max_idle = self.max_idle_per_host;
        let PooledConnection { origin, mut sender, .. } = handle;
        self.scheduler.spawn(async move {
            let ready = tokio::time::timeout(idle_timeout, sender.ready()).await;
            match ready {
                Ok(Ok(())) => {
                    if let Ok(mut idle) = idle.lock() {
                        let entries = idle.entry(origin.clone()).or_default();
                        if entries.len() < max_idle {
                            entries.push(IdleConnection {
                                sender,
                                idle_since: Instant::now(),
                            });
                            trace!("Returned connection to {} to the pool", origin);
                        }
                    }
                }
                _ => trace!("Connection to {} not reusable", origin),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::empty;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Origin answering every request on a connection with a fixed body.
    async fn keep_alive_origin() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut pending = Vec::new();
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        pending.extend_from_slice(&buf[..n]);
                        while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                            pending.drain(..end + 4);
                            if stream
                                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    fn origin(addr: std::net::SocketAddr) -> Origin {
        Origin {
            scheme: OriginScheme::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    fn request() -> Request<ProxyBody> {
        Request::builder()
            .uri("/")
            .header("host", "localhost")
            .body(empty())
            .unwrap()
    }

    async fn wait_for_idle(transport: &PooledTransport, origin: &Origin, expected: usize) {
        for _ in 0..100 {
            if transport.idle_connections(origin) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} idle connections", expected);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (addr, accepted) = keep_alive_origin().await;
        let origin = origin(addr);
        let transport = PooledTransport::new(Scheduler::new(), Duration::from_secs(2));

        let mut handle = transport.acquire(&origin).await.unwrap();
        assert!(!handle.is_reused());
        let response = transport.send(&mut handle, request()).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
        transport.release(handle);
        wait_for_idle(&transport, &origin, 1).await;

        let mut handle = transport.acquire(&origin).await.unwrap();
        assert!(handle.is_reused());
        let response = transport.send(&mut handle, request()).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_pool_never_keeps_connections() {
        let (addr, accepted) = keep_alive_origin().await;
        let origin = origin(addr);
        let transport = PooledTransport::new(Scheduler::new(), Duration::from_secs(2)).with_pool(false, 10);

        for _ in 0..2 {
            let mut handle = transport.acquire(&origin).await.unwrap();
            let response = transport.send(&mut handle, request()).await.unwrap();
            response.into_body().collect().await.unwrap();
            transport.release(handle);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.idle_connections(&origin), 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = PooledTransport::new(Scheduler::new(), Duration::from_secs(2));
        let err = transport.acquire(&origin(addr)).await.err().unwrap();
        assert!(matches!(err, ProxyError::ConnectRefused { .. }));
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_GATEWAY);
    }
}
