//! Non-blocking duplex endpoint over a raw byte stream.
//!
//! An [`Endpoint`] wraps one socket (or any `AsyncRead + AsyncWrite`) and
//! exposes fill/flush primitives. A fill suspends the calling task until the
//! stream is readable, [`Endpoint::try_fill`] reports [`Fill::WouldBlock`]
//! instead of suspending. Flushes may accept fewer bytes than offered; the
//! caller owns the remainder. Closing is idempotent.

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};

/// Result of a single fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Filled(usize),
    WouldBlock,
    /// The remote half-closed its output.
    Eof,
}

pub struct Endpoint<S> {
    stream: Option<S>,
    remote_addr: Option<SocketAddr>,
    input_shutdown: bool,
    output_shutdown: bool,
}

impl<S> Endpoint<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            remote_addr: None,
            input_shutdown: false,
            output_shutdown: false,
        }
    }

    pub fn with_remote_addr(mut self, remote: SocketAddr) -> Self {
        self.remote_addr = Some(remote);
        self
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Releases the underlying stream. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        self.input_shutdown = true;
        self.output_shutdown = true;
        self.stream.take().is_some()
    }

    pub fn into_inner(mut self) -> Option<S> {
        self.stream.take()
    }

    fn stream_mut(&mut self) -> io::Result<&mut S> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))
    }
}

impl<S: AsyncRead + Unpin> Endpoint<S> {
    /// Reads whatever is available into the spare capacity of `buf`.
    pub async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<Fill> {
        if self.input_shutdown {
            return if self.stream.is_some() {
                Ok(Fill::Eof)
            } else {
                Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))
            };
        }

        let read = self.stream_mut()?.read_buf(buf).await?;

        if read == 0 {
            self.input_shutdown = true;
            Ok(Fill::Eof)
        } else {
            Ok(Fill::Filled(read))
        }
    }

    /// Fills without suspending; [`Fill::WouldBlock`] means nothing was ready.
    pub fn try_fill(&mut self, buf: &mut BytesMut) -> io::Result<Fill> {
        match self.fill(buf).now_or_never() {
            Some(result) => result,
            None => Ok(Fill::WouldBlock),
        }
    }
}

impl<S: AsyncWrite + Unpin> Endpoint<S> {
    /// Writes as much of `data` as the transport accepts and returns that length.
    pub async fn flush(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.output_shutdown {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint output shut down"));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let written = self.stream_mut()?.write(data).await?;
        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "endpoint accepted no bytes"));
        }
        Ok(written)
    }

    /// Flushes `data` completely, retrying partial writes.
    pub async fn flush_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let written = self.flush(data).await?;
            data = &data[written..];
        }
        self.stream_mut()?.flush().await
    }

    /// Half-closes the output side. Repeated calls are no-ops.
    pub async fn shutdown_output(&mut self) -> io::Result<()> {
        if self.output_shutdown {
            return Ok(());
        }
        self.output_shutdown = true;
        match self.stream.as_mut() {
            Some(stream) => match stream.shutdown().await {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }
}

impl<S: AsyncRead + AsyncWrite> Endpoint<S> {
    /// Splits into a read-only and a write-only endpoint sharing the stream.
    pub fn split(mut self) -> io::Result<(Endpoint<ReadHalf<S>>, Endpoint<WriteHalf<S>>)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))?;
        let (read_half, write_half) = tokio::io::split(stream);

        let reader = Endpoint {
            stream: Some(read_half),
            remote_addr: self.remote_addr,
            input_shutdown: self.input_shutdown,
            output_shutdown: true,
        };
        let writer = Endpoint {
            stream: Some(write_half),
            remote_addr: self.remote_addr,
            input_shutdown: true,
            output_shutdown: self.output_shutdown,
        };
        Ok((reader, writer))
    }
}

/// Stream that replays bytes already consumed from `inner` before reading it again.
pub struct PrefixedIo<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(out.remaining());
            let chunk = this.prefix.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
