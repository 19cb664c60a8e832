//! Upstream transport stack.
//!
//! Opening a connection runs the configured socket layers bottom-up under one
//! deadline: TCP connect, CONNECT negotiation (override keys on tunnel
//! clusters only), then the TLS handshake. The result is a byte stream ready
//! for the HTTP codec.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace, warn};

use burrow_common::{Authority, ConnectionId};
use burrow_config::{ClusterConfig, ConnectAuthority, Http11ConnectConfig};

use crate::pool_key::PoolKey;
use crate::tls::UpstreamTls;
use crate::tunnel::{establish, ConnectRequest, TunnelError, TunnelState, TunnelStream};
use crate::upstream::UpstreamError;

/// CONNECT settings of an `http11-connect` cluster
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    authority: ConnectAuthority,
    sni_host: Option<String>,
    headers: Vec<(String, String)>,
    max_response_header_bytes: usize,
}

impl TunnelOptions {
    fn from_config(config: &Http11ConnectConfig, sni_host: Option<String>) -> Self {
        Self {
            authority: config.authority,
            sni_host,
            headers: config
                .request_headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            max_response_header_bytes: config.max_response_header_bytes,
        }
    }

    /// Build the CONNECT request for a tunnel to `destination`
    pub fn request_for(&self, destination: &Authority) -> ConnectRequest {
        let target = match (self.authority, &self.sni_host) {
            (ConnectAuthority::Sni { port }, Some(sni)) => Authority::new(sni.clone(), port),
            _ => destination.clone(),
        };
        self.headers
            .iter()
            .fold(ConnectRequest::new(target), |req, (name, value)| {
                req.with_header(name.clone(), value.clone())
            })
    }
}

/// The socket layers of a cluster
#[derive(Debug, Clone)]
pub struct TransportStack {
    tunnel: Option<TunnelOptions>,
    tls: Option<UpstreamTls>,
    connect_timeout: Duration,
}

impl TransportStack {
    pub fn from_config(cluster: &ClusterConfig) -> Result<Self, UpstreamError> {
        let tls_config = cluster.tls();
        let tls = tls_config.map(UpstreamTls::from_config).transpose()?;
        let sni_host = tls_config.and_then(|t| t.sni.clone());
        let tunnel = cluster
            .tunnel()
            .map(|connect| TunnelOptions::from_config(connect, sni_host));

        Ok(Self {
            tunnel,
            tls,
            connect_timeout: Duration::from_secs(cluster.timeouts.connect_secs),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether override destinations are tunneled on this stack
    pub fn tunnels(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open a new connection for `key`
    pub async fn connect(
        &self,
        key: &PoolKey,
        endpoint: &Authority,
    ) -> Result<Connected, UpstreamError> {
        let deadline = deadline_after(self.connect_timeout);
        let target = key.dial_target(endpoint);
        let id = ConnectionId::next();

        let addrs = timeout_at(deadline, resolve(target))
            .await
            .map_err(|_| self.timed_out("resolve"))??;

        let tcp = timeout_at(deadline, connect_any(target, &addrs))
            .await
            .map_err(|_| self.timed_out("connect"))??;
        if let Err(e) = tcp.set_nodelay(true) {
            trace!(connection = %id, error = %e, "Failed to set TCP_NODELAY");
        }

        let request = match (&self.tunnel, key.destination()) {
            (Some(tunnel), Some(dest)) => Some((
                tunnel.request_for(dest.authority()),
                tunnel.max_response_header_bytes,
            )),
            _ => None,
        };

        let stream = match &request {
            Some((request, max)) => {
                match timeout_at(deadline, establish(tcp, Some(request), *max)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!(
                            connection = %id,
                            pool_key = %key,
                            kind = e.kind(),
                            error = %e,
                            "CONNECT negotiation failed"
                        );
                        return Err(e.into());
                    }
                    Err(_) => {
                        warn!(connection = %id, pool_key = %key, "CONNECT negotiation timed out");
                        return Err(TunnelError::Timeout(self.connect_timeout).into());
                    }
                }
            }
            None => TunnelStream::passthrough(tcp),
        };

        let io = match &self.tls {
            Some(tls) => {
                let fallback_host = target.host().to_string();
                let tls_stream = timeout_at(deadline, tls.handshake(stream, &fallback_host))
                    .await
                    .map_err(|_| self.timed_out("tls handshake"))??;
                UpstreamIo::Tls(Box::new(tls_stream))
            }
            None => UpstreamIo::Plain(stream),
        };

        let alpn = io.alpn_protocol().map(<[u8]>::to_vec);
        let alpn_name = alpn.as_deref().map(String::from_utf8_lossy);
        debug!(
            connection = %id,
            pool_key = %key,
            upstream = %target,
            tunnel = %io.tunnel_state(),
            alpn = alpn_name.as_deref(),
            "Upstream connection ready"
        );

        Ok(Connected { id, io, alpn })
    }

    fn timed_out(&self, operation: &'static str) -> UpstreamError {
        UpstreamError::Timeout {
            operation,
            duration: self.connect_timeout,
        }
    }
}

/// Deadline `timeout` from now, saturating to roughly 30 years out
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

/// Resolve an authority, skipping DNS for IP literals
pub async fn resolve(authority: &Authority) -> Result<Vec<SocketAddr>, UpstreamError> {
    if let Some(addr) = authority.socket_addr() {
        return Ok(vec![addr]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((authority.host(), authority.port()))
        .await
        .map_err(|source| UpstreamError::Resolve {
            authority: authority.clone(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(UpstreamError::Resolve {
            authority: authority.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

async fn connect_any(target: &Authority, addrs: &[SocketAddr]) -> Result<TcpStream, UpstreamError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(upstream = %target, addr = %addr, error = %e, "TCP connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(UpstreamError::Connect {
        authority: target.clone(),
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")),
    })
}

/// A freshly opened upstream connection
#[derive(Debug)]
pub struct Connected {
    pub id: ConnectionId,
    pub io: UpstreamIo,
    /// Protocol chosen by TLS ALPN, if any
    pub alpn: Option<Vec<u8>>,
}

/// Byte stream at the top of the transport stack
#[derive(Debug)]
pub enum UpstreamIo {
    Plain(TunnelStream<TcpStream>),
    Tls(Box<TlsStream<TunnelStream<TcpStream>>>),
}

impl UpstreamIo {
    fn tunnel(&self) -> &TunnelStream<TcpStream> {
        match self {
            UpstreamIo::Plain(stream) => stream,
            UpstreamIo::Tls(stream) => stream.get_ref().0,
        }
    }

    pub fn tunnel_state(&self) -> &TunnelState {
        self.tunnel().state()
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            UpstreamIo::Plain(_) => None,
            UpstreamIo::Tls(stream) => stream.get_ref().1.alpn_protocol(),
        }
    }
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
