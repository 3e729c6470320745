//! CONNECT tunneling.
//!
//! The handler parses the authority-form target, opens the outbound socket
//! under the configured connect timeout and answers with the literal
//! `200 Connection Established` line before handing both connections to the
//! [`TunnelRelay`]. Failures are answered with an empty-bodied status and the
//! client connection is closed. No attempt is retried.

use crate::access::AccessRules;
use crate::config::Config;
use crate::connection::{Connection, Side};
use crate::endpoint::Endpoint;
use crate::error::ProxyError;
use crate::request::{ConnectTarget, RequestHead};
use crate::scheduler::Scheduler;
use crate::tunnel::{RelayStats, TunnelRelay};
use async_trait::async_trait;
use hyper::StatusCode;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Empty-bodied response sent when a CONNECT cannot be served.
pub fn failure_response(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    )
}

/// Opens outbound byte streams to CONNECT targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, target: &ConnectTarget) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &ConnectTarget) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((target.resolver_host(), target.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

pub struct ConnectHandler<C = TcpConnector> {
    connector: Arc<C>,
    connect_timeout: Duration,
    buffer_size: usize,
    access: Arc<AccessRules>,
    relay: TunnelRelay,
}

impl<C> Clone for ConnectHandler<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            connect_timeout: self.connect_timeout,
            buffer_size: self.buffer_size,
            access: self.access.clone(),
            relay: self.relay.clone(),
        }
    }
}

impl ConnectHandler<TcpConnector> {
    pub fn from_config(config: &Config, scheduler: Scheduler) -> Self {
        Self::new(TcpConnector, TunnelRelay::new(scheduler, config.drain_timeout()))
            .with_connect_timeout(config.connect_timeout())
            .with_buffer_size(config.buffer_size())
            .with_tunnel_idle_timeout(config.tunnel_idle_timeout())
            .with_access_rules(AccessRules::new(&config.allowed_hosts, &config.denied_hosts))
    }
}

impl<C: Connector> ConnectHandler<C> {
    pub fn new(connector: C, relay: TunnelRelay) -> Self {
        Self {
            connector: Arc::new(connector),
            connect_timeout: Duration::from_secs(crate::config::DEFAULT_CONNECT_TIMEOUT_SECS),
            buffer_size: crate::config::DEFAULT_BUFFER_SIZE,
            access: Arc::new(AccessRules::allow_all()),
            relay,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Tunnels with no traffic either way for `timeout` are closed.
    pub fn with_tunnel_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay = self.relay.with_idle_timeout(timeout);
        self
    }

    pub fn with_access_rules(mut self, access: AccessRules) -> Self {
        self.access = Arc::new(access);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        self.relay.idle_timeout()
    }

    /// Opens the outbound connection for `target`, bounded by the connect timeout.
    pub async fn connect_origin(&self, target: &ConnectTarget) -> Result<C::Stream, ProxyError> {
        self.access.check(&target.host)?;

        debug!("Connecting to {} (timeout {:?})", target, self.connect_timeout);
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::ConnectRefused {
                target: target.to_string(),
                source: e,
            }),
            Err(_) => Err(ProxyError::ConnectTimeout {
                target: target.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Serves a CONNECT whose head is at the front of `client`'s buffer.
    ///
    /// Bytes the client pipelined after the head are relayed to the origin
    /// ahead of anything read later.
    pub async fn handle<S>(&self, mut client: Connection<S>, head: &RequestHead) -> Result<RelayStats, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        client.consume(head.header_len);

        let target = match self.parse_target(head) {
            Ok(target) => target,
            Err(e) => {
                warn!("Rejecting CONNECT {}: {}", head.target, e);
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        let stream = match self.connect_origin(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("CONNECT {} failed: {}", target, e);
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        client.write_all(CONNECT_ESTABLISHED).await.map_err(ProxyError::RelayIo)?;
        self.tunnel(client, &target, stream).await
    }

    /// Relays between an already-answered client and a connected origin stream.
    pub async fn tunnel<S>(&self, client: Connection<S>, target: &ConnectTarget, stream: C::Stream) -> Result<RelayStats, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let origin = Connection::new(Endpoint::new(stream), Side::Origin, self.buffer_size);

        let peer = client.endpoint().remote_addr();
        info!(
            "Tunnel established from {} to {}",
            peer.map_or_else(|| "-".to_string(), |addr| addr.to_string()),
            target
        );
        match self.relay.relay(client, origin).await {
            Ok(stats) => {
                info!(
                    "Tunnel to {} closed: {} bytes client -> origin, {} bytes origin -> client",
                    target, stats.client_to_origin, stats.origin_to_client
                );
                Ok(stats)
            }
            Err(e) => {
                debug!("Tunnel to {} ended with error: {}", target, e);
                Err(e)
            }
        }
    }

    fn parse_target(&self, head: &RequestHead) -> Result<ConnectTarget, ProxyError> {
        if !head.is_connect() {
            return Err(ProxyError::MalformedRequest(format!(
                "Expected CONNECT, got {}",
                head.method
            )));
        }
        ConnectTarget::parse(&head.target)
    }
}

/// Answers `error` with an empty-bodied status and closes the client.
pub(crate) async fn reject<S>(client: &mut Connection<S>, error: &ProxyError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = failure_response(error.status_code());
    if client.write_all(response.as_bytes()).await.is_ok() {
        let _ = client.shutdown_output().await;
    }
    client.close();
}
