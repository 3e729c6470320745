use crate::access::AccessRules;
use crate::common::{ProxyBody, ResponseBuilder, empty};
use crate::config::Config;
use crate::connect_handler::{ConnectHandler, Connector, TcpConnector};
use crate::connection::{Connection, Side};
use crate::endpoint::Endpoint;
use crate::error::ProxyError;
use crate::request::{ConnectTarget, ForwardRequest};
use crate::scheduler::Scheduler;
use crate::transport::{ClientTransport, PooledTransport};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

type ServerBuilder = hyper::server::conn::http1::Builder;

/// hyper refuses read buffers smaller than this.
const MIN_READ_BUFFER: usize = 8192;

/// Forwards absolute-form requests to their origin and streams the answer back.
///
/// A CONNECT arriving on a connection hyper already serves (a keep-alive
/// follow-up) is answered here as well and tunneled over the upgraded stream.
pub struct ForwardProxy<T = PooledTransport, C = TcpConnector> {
    transport: Arc<T>,
    connect: ConnectHandler<C>,
    access: Arc<AccessRules>,
    scheduler: Scheduler,
    max_header_size: usize,
}

impl ForwardProxy<PooledTransport, TcpConnector> {
    pub fn from_config(config: &Config, scheduler: Scheduler) -> Self {
        let transport = PooledTransport::from_config(config, scheduler.clone());
        let connect = ConnectHandler::from_config(config, scheduler.clone());
        Self::new(transport, connect, scheduler)
            .with_access_rules(AccessRules::new(&config.allowed_hosts, &config.denied_hosts))
            .with_max_header_size(config.max_header_size())
    }
}

impl<T: ClientTransport, C: Connector> ForwardProxy<T, C> {
    pub fn new(transport: T, connect: ConnectHandler<C>, scheduler: Scheduler) -> Self {
        Self {
            transport: Arc::new(transport),
            connect,
            access: Arc::new(AccessRules::allow_all()),
            scheduler,
            max_header_size: crate::config::DEFAULT_MAX_HEADER_SIZE,
        }
    }

    pub fn with_access_rules(mut self, access: AccessRules) -> Self {
        self.access = Arc::new(access);
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn connect_handler(&self) -> &ConnectHandler<C> {
        &self.connect
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    /// Serves HTTP/1 requests on `io` until the client goes away.
    pub async fn serve_connection<I>(self: Arc<Self>, io: I) -> Result<(), ProxyError>
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let proxy = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move { proxy.handle_request(req).await }
        });

        ServerBuilder::new()
            .preserve_header_case(true)
            .max_buf_size(self.max_header_size.max(MIN_READ_BUFFER))
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
            .map_err(ProxyError::from)
    }

    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, Infallible>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let target = req.uri().to_string();
        match self.process_request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("{} {} failed: {}", method, target, e);
                Ok(ResponseBuilder::from_error(&e))
            }
        }
    }

    async fn process_request<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        self.forward(req).await
    }

    /// Rewrites an absolute-form request to origin form and relays it.
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let forward = ForwardRequest::from_parts(req.method(), req.uri(), req.version())?;
        self.access.check(&forward.origin.host)?;

        info!("{} -> {} ({})", forward.original_target, forward.origin, forward.request_line());

        let mut req = req.map(|body| body.boxed());
        forward.rewrite(&mut req)?;

        let mut handle = self.transport.acquire(&forward.origin).await?;
        let response = self.transport.send(&mut handle, req).await?;
        // Pooled handles are only reused once the response body has been read.
        self.transport.release(handle);

        debug!("{} answered {}", forward.origin, response.status());
        Ok(response)
    }

    async fn handle_connect<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Send + 'static,
    {
        let authority = req.uri().authority().ok_or_else(|| {
            ProxyError::MalformedRequest(format!("CONNECT target '{}' must be host:port", req.uri()))
        })?;
        let target = ConnectTarget::from_authority(authority)?;
        let stream = self.connect.connect_origin(&target).await?;

        let handler = self.connect.clone();
        self.scheduler.spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let endpoint = Endpoint::new(TokioIo::new(upgraded));
                    let client = Connection::new(endpoint, Side::Client, handler.buffer_size());
                    let _ = handler.tunnel(client, &target, stream).await;
                }
                Err(e) => warn!("Upgrade for CONNECT {} failed: {}", target, e),
            }
        });

        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::OK;
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }
}
