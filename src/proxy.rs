use crate::common::TlsConfig;
use crate::config::Config;
use crate::connect_handler::{self, Connector, TcpConnector};
use crate::connection::{Connection, Side};
use crate::endpoint::{Endpoint, PrefixedIo};
use crate::error::ProxyError;
use crate::forward_proxy::ForwardProxy;
use crate::scheduler::Scheduler;
use crate::transport::{ClientTransport, PooledTransport};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;

/// Accept loop in front of the Connect Handler and Forwarding Proxy.
///
/// The first request head of every connection is read raw. A CONNECT is
/// answered byte-exactly and tunneled; anything else is replayed into a
/// hyper HTTP/1 connection that keeps serving the client.
pub struct ProxyServer<T = PooledTransport, C = TcpConnector> {
    listener: TcpListener,
    local_addr: SocketAddr,
    proxy: Arc<ForwardProxy<T, C>>,
    scheduler: Scheduler,
    tls: Option<TlsAcceptor>,
    connections: Option<Arc<Semaphore>>,
}

impl ProxyServer<PooledTransport, TcpConnector> {
    pub async fn bind(config: &Config, scheduler: Scheduler) -> Result<Self, ProxyError> {
        let tls = match (&config.private_key, &config.certificate) {
            (Some(private_key_path), Some(cert_path)) => {
                debug!("Loading TLS certificate from: {}", cert_path);
                debug!("Loading TLS private key from: {}", private_key_path);
                TlsConfig::validate_tls_files(private_key_path, cert_path)?;
                let tls_config = TlsConfig::create_config(private_key_path, cert_path)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            _ => None,
        };

        let proxy = ForwardProxy::from_config(config, scheduler.clone());
        let server = Self::bind_with(config.listen_addr, proxy, scheduler)
            .await?
            .with_tls(tls)
            .with_max_connections(config.max_connections);
        Ok(server)
    }
}

impl<T: ClientTransport, C: Connector> ProxyServer<T, C> {
    pub async fn bind_with(addr: SocketAddr, proxy: ForwardProxy<T, C>, scheduler: Scheduler) -> Result<Self, ProxyError> {
        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            proxy: Arc::new(proxy),
            scheduler,
            tls: None,
            connections: None,
        })
    }

    pub fn with_tls(mut self, tls: Option<TlsAcceptor>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_max_connections(mut self, max_connections: Option<usize>) -> Self {
        self.connections = max_connections
            .filter(|max| *max > 0)
            .map(|max| Arc::new(Semaphore::new(max)));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts until the scheduler shuts down.
    pub async fn run(self) -> Result<(), ProxyError> {
        let shutdown = self.scheduler.child_token();
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!("Forward proxy listening on: {}://{}", scheme, self.local_addr);

        loop {
            let permit = match &self.connections {
                Some(connections) => tokio::select! {
                    permit = connections.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = shutdown.cancelled() => break,
                },
                None => None,
            };

            let (stream, remote_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };
            let _ = stream.set_nodelay(true);
            debug!("Accepted connection from {}", remote_addr);

            let proxy = self.proxy.clone();
            let tls = self.tls.clone();
            self.scheduler.spawn(async move {
                let _permit = permit;
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_client(proxy, tls_stream, remote_addr).await,
                        Err(e) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
                    },
                    None => serve_client(proxy, stream, remote_addr).await,
                }
            });
        }

        info!("Forward proxy on {} stopped accepting", self.local_addr);
        Ok(())
    }
}

async fn serve_client<S, T, C>(proxy: Arc<ForwardProxy<T, C>>, stream: S, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    T: ClientTransport,
    C: Connector,
{
    let handler = proxy.connect_handler();
    let endpoint = Endpoint::new(stream).with_remote_addr(remote_addr);
    let mut client = Connection::new(endpoint, Side::Client, handler.buffer_size());

    let head = match client.peek_request_head(proxy.max_header_size()).await {
        Ok(head) => head,
        Err(ProxyError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("{} closed before sending a request", remote_addr);
            return;
        }
        Err(e) => {
            warn!("Bad request from {}: {}", remote_addr, e);
            connect_handler::reject(&mut client, &e).await;
            return;
        }
    };

    if head.is_connect() {
        if let Err(e) = handler.handle(client, &head).await {
            debug!("CONNECT from {} ended: {}", remote_addr, e);
        }
        return;
    }

    // Replay everything read so far into hyper.
    let (endpoint, buffered, _handle) = client.into_parts();
    let Some(stream) = endpoint.into_inner() else {
        return;
    };
    let io = PrefixedIo::new(buffered.freeze(), stream);
    if let Err(e) = proxy.serve_connection(io).await {
        debug!("Connection from {} ended: {}", remote_addr, e);
    }
}
