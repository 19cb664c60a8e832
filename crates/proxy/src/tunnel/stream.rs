//! Tunnel driver and pass-through stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use super::negotiator::{ConnectRequest, Negotiator, Progress, TunnelState};
use super::TunnelError;

const READ_CHUNK: usize = 4096;

/// A byte stream that is ready for the inner protocol.
///
/// Bytes that arrived after the CONNECT response terminator are kept in
/// `prefix` and returned by the first reads, ahead of anything still on the
/// socket. Writes go straight to the socket.
#[derive(Debug)]
pub struct TunnelStream<S> {
    inner: S,
    prefix: Bytes,
    state: TunnelState,
}

impl<S> TunnelStream<S> {
    /// Wrap a stream that needs no tunnel
    pub fn passthrough(inner: S) -> Self {
        Self {
            inner,
            prefix: Bytes::new(),
            state: TunnelState::NotNeeded,
        }
    }

    fn established(inner: S, prefix: Bytes) -> Self {
        Self {
            inner,
            prefix,
            state: TunnelState::Established,
        }
    }

    /// `NotNeeded` or `Established`
    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    pub fn is_tunneled(&self) -> bool {
        matches!(self.state, TunnelState::Established)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Bytes received after the CONNECT response that have not been read yet
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }
}

/// Negotiate a tunnel on a freshly opened stream.
///
/// With no request the stream is returned as a pass-through. Otherwise the
/// preamble is written before anything else and the response is read until
/// the header block completes. On error the stream is dropped, closing it.
pub async fn establish<S>(
    mut io: S,
    request: Option<&ConnectRequest>,
    max_response_header_bytes: usize,
) -> Result<TunnelStream<S>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(request) = request else {
        return Ok(TunnelStream::passthrough(io));
    };

    let preamble = request.encode();
    trace!(
        target_authority = %request.authority(),
        bytes = preamble.len(),
        "Writing CONNECT preamble"
    );
    io.write_all(&preamble).await?;
    io.flush().await?;

    let mut negotiator = Negotiator::awaiting_response(max_response_header_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match io.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) => {
                negotiator.fail();
                return Err(TunnelError::Io(e));
            }
        };

        if n == 0 {
            return Err(negotiator.peer_closed());
        }

        match negotiator.feed(&chunk[..n])? {
            Progress::NeedMore => {
                trace!(buffered = negotiator.buffered(), "CONNECT response incomplete");
            }
            Progress::Established { remainder } => {
                debug!(
                    target_authority = %request.authority(),
                    leftover = remainder.len(),
                    "CONNECT tunnel established"
                );
                return Ok(TunnelStream::established(io, remainder));
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            let head = this.prefix.split_to(n);
            buf.put_slice(&head);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
