//! Connection state machine bound to one [`Endpoint`].
//!
//! A [`Connection`] owns its endpoint and read buffer. Its lifecycle state
//! lives in a shared [`ConnectionHandle`] so a tunnel peer can observe and
//! trigger closure without owning the connection. Two handles bound into a
//! [`TunnelPair`] hold non-owning links to each other; entering `Closed` on
//! one closes the other.

use crate::endpoint::{Endpoint, Fill};
use crate::error::ProxyError;
use crate::request::RequestHead;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::io;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    /// Our output is shut down; the remote may still send.
    HalfClosedLocal = 1,
    /// The remote sent EOF; we may still write.
    HalfClosedRemote = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::HalfClosedLocal,
            2 => ConnectionState::HalfClosedRemote,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Origin,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Origin => write!(f, "origin"),
        }
    }
}

/// Shared lifecycle state of one connection.
pub struct ConnectionHandle {
    id: u64,
    side: Side,
    state: AtomicU8,
    closed: CancellationToken,
    peer: Mutex<Option<Weak<ConnectionHandle>>>,
}

impl ConnectionHandle {
    pub fn new(side: Side) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            side,
            state: AtomicU8::new(ConnectionState::Open as u8),
            closed: CancellationToken::new(),
            peer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves once this connection has entered `Closed`.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_paired(&self) -> bool {
        self.peer.lock().map(|peer| peer.is_some()).unwrap_or(false)
    }

    pub fn peer(&self) -> Option<Arc<ConnectionHandle>> {
        self.peer
            .lock()
            .ok()
            .and_then(|peer| peer.as_ref().and_then(Weak::upgrade))
    }

    /// The remote sent EOF.
    pub fn on_remote_eof(&self) -> ConnectionState {
        self.transition(|state| match state {
            ConnectionState::Open => ConnectionState::HalfClosedRemote,
            ConnectionState::HalfClosedLocal => ConnectionState::Closed,
            other => other,
        })
    }

    /// Our output side was shut down after flushing.
    pub fn on_local_shutdown(&self) -> ConnectionState {
        self.transition(|state| match state {
            ConnectionState::Open => ConnectionState::HalfClosedLocal,
            ConnectionState::HalfClosedRemote => ConnectionState::Closed,
            other => other,
        })
    }

    /// Moves to `Closed` unconditionally. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let previous = ConnectionState::from_u8(
            self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel),
        );
        if previous == ConnectionState::Closed {
            return false;
        }
        self.on_closed();
        true
    }

    fn transition(&self, next: impl Fn(ConnectionState) -> ConnectionState) -> ConnectionState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            let to = next(from);
            if to == from {
                return from;
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    trace!("{} connection {}: {:?} -> {:?}", self.side, self.id, from, to);
                    if to == ConnectionState::Closed {
                        self.on_closed();
                    }
                    return to;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn on_closed(&self) {
        debug!("{} connection {} closed", self.side, self.id);
        self.closed.cancel();
        let peer = self
            .peer
            .lock()
            .ok()
            .and_then(|mut peer| peer.take())
            .and_then(|peer| peer.upgrade());
        if let Some(peer) = peer {
            peer.close();
        }
    }
}

/// Two connections bridged for raw relay.
pub struct TunnelPair {
    client: Arc<ConnectionHandle>,
    origin: Arc<ConnectionHandle>,
}

impl TunnelPair {
    /// Links `client` and `origin`. Fails if either already belongs to a pair.
    pub fn bind(client: &Arc<ConnectionHandle>, origin: &Arc<ConnectionHandle>) -> Result<Self, ProxyError> {
        if Arc::ptr_eq(client, origin) {
            return Err(ProxyError::AlreadyPaired);
        }

        // Lock in id order so concurrent binds cannot deadlock.
        let (first, second) = if client.id < origin.id {
            (client, origin)
        } else {
            (origin, client)
        };
        {
            let mut first_peer = first
                .peer
                .lock()
                .map_err(|_| ProxyError::AlreadyPaired)?;
            let mut second_peer = second
                .peer
                .lock()
                .map_err(|_| ProxyError::AlreadyPaired)?;
            if first_peer.is_some() || second_peer.is_some() {
                return Err(ProxyError::AlreadyPaired);
            }
            *first_peer = Some(Arc::downgrade(second));
            *second_peer = Some(Arc::downgrade(first));
        }

        let pair = Self {
            client: client.clone(),
            origin: origin.clone(),
        };
        // A member that closed before the link existed still takes its peer down.
        if client.is_closed() || origin.is_closed() {
            pair.close();
        }
        Ok(pair)
    }

    pub fn client(&self) -> &Arc<ConnectionHandle> {
        &self.client
    }

    pub fn origin(&self) -> &Arc<ConnectionHandle> {
        &self.origin
    }

    pub fn close(&self) {
        self.client.close();
        self.origin.close();
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed() && self.origin.is_closed()
    }
}

/// Protocol state machine bound to one endpoint for its lifetime.
pub struct Connection<S> {
    endpoint: Endpoint<S>,
    buffer: BytesMut,
    buffer_size: usize,
    handle: Arc<ConnectionHandle>,
}

impl<S> Connection<S> {
    pub fn new(endpoint: Endpoint<S>, side: Side, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            endpoint,
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
            handle: ConnectionHandle::new(side),
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn endpoint(&self) -> &Endpoint<S> {
        &self.endpoint
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes read from the endpoint and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        let _ = self.buffer.split_to(n);
    }

    pub fn take_buffered(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Releases the endpoint and enters `Closed`. Safe to call repeatedly.
    pub fn close(&mut self) -> bool {
        let released = self.endpoint.close();
        let transitioned = self.handle.close();
        released || transitioned
    }

    pub fn into_parts(self) -> (Endpoint<S>, BytesMut, Arc<ConnectionHandle>) {
        (self.endpoint, self.buffer, self.handle)
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Fills the read buffer from the endpoint and applies the resulting transition.
    pub async fn fill(&mut self) -> io::Result<Fill> {
        self.buffer.reserve(self.buffer_size);
        match self.endpoint.fill(&mut self.buffer).await {
            Ok(Fill::Eof) => {
                self.handle.on_remote_eof();
                Ok(Fill::Eof)
            }
            Ok(fill) => Ok(fill),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Buffers until a complete request head is available and returns it
    /// without consuming it.
    pub async fn peek_request_head(&mut self, max_header_size: usize) -> Result<RequestHead, ProxyError> {
        loop {
            if let Some(head) = RequestHead::parse(&self.buffer)? {
                return Ok(head);
            }
            if self.buffer.len() >= max_header_size {
                return Err(ProxyError::MalformedRequest(format!(
                    "Request head exceeds {} bytes",
                    max_header_size
                )));
            }
            match self.fill().await? {
                Fill::Eof if self.buffer.is_empty() => {
                    return Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before sending a request",
                    )));
                }
                Fill::Eof => {
                    return Err(ProxyError::MalformedRequest(
                        "Connection closed inside the request head".to_string(),
                    ));
                }
                Fill::Filled(_) | Fill::WouldBlock => {}
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Writes `data` completely; any I/O error closes the connection.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.endpoint.flush_all(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    pub async fn shutdown_output(&mut self) -> io::Result<()> {
        let result = self.endpoint.shutdown_output().await;
        self.handle.on_local_shutdown();
        result
    }
}
