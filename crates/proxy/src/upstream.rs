//! Cluster client: pooled HTTP over the transport stack.
//!
//! `send` derives the pool key from the request's override destination,
//! reuses a ready connection with that key or establishes a new one, and
//! drives the request with hyper's HTTP/1.1 or HTTP/2 client connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::uri::{Authority as UriAuthority, PathAndQuery, Scheme, Uri};
use http::{Request, Response, Version};
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use burrow_common::{Authority, BurrowError, ClusterId};
use burrow_config::{ClusterConfig, HttpProtocol};

use crate::metadata::OverrideDestination;
use crate::pool::{ConnectionPool, PoolSettings, PoolStats, Poolable};
use crate::pool_key::PoolKey;
use crate::tls::TlsError;
use crate::transport::{Connected, TransportStack};
use crate::tunnel::{TunnelError, TunnelState};

/// Request and response body type used on upstream connections
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Errors from acquiring an upstream connection or sending a request on it
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to resolve {authority}: {source}")]
    Resolve {
        authority: Authority,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: Authority,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("upstream request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    #[error("cluster '{cluster}' has no http11-connect transport for override destinations")]
    OverrideNotSupported { cluster: ClusterId },

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Convert into the edge error type for `cluster`
    pub fn into_burrow_error(self, cluster: &ClusterId) -> BurrowError {
        match self {
            UpstreamError::Timeout {
                operation,
                duration,
            } => BurrowError::timeout(operation, duration_ms(duration)),
            UpstreamError::Tunnel(TunnelError::Timeout(duration)) => {
                BurrowError::timeout("CONNECT negotiation", duration_ms(duration))
            }
            UpstreamError::OverrideNotSupported { .. } | UpstreamError::InvalidRequest(_) => {
                BurrowError::RequestValidation {
                    reason: self.to_string(),
                }
            }
            UpstreamError::Tls(e) => BurrowError::Tls {
                message: e.to_string(),
                source: Some(Box::new(e)),
            },
            other => BurrowError::upstream(cluster.as_str(), other),
        }
    }
}

// ============================================================================
// Connection Handles
// ============================================================================

/// HTTP client handle for one pooled connection
#[derive(Debug)]
pub enum UpstreamSender {
    Http1(http1::SendRequest<Body>),
    Http2(http2::SendRequest<Body>),
}

impl UpstreamSender {
    pub fn is_http2(&self) -> bool {
        matches!(self, UpstreamSender::Http2(_))
    }

    async fn send_request(&mut self, req: Request<Body>) -> Result<Response<Incoming>, hyper::Error> {
        match self {
            UpstreamSender::Http1(sender) => sender.send_request(req).await,
            UpstreamSender::Http2(sender) => sender.send_request(req).await,
        }
    }
}

impl Poolable for UpstreamSender {
    fn is_open(&self) -> bool {
        match self {
            UpstreamSender::Http1(sender) => !sender.is_closed(),
            UpstreamSender::Http2(sender) => !sender.is_closed(),
        }
    }

    fn share(&self) -> Option<Self> {
        match self {
            UpstreamSender::Http1(_) => None,
            UpstreamSender::Http2(sender) => Some(UpstreamSender::Http2(sender.clone())),
        }
    }
}

// ============================================================================
// Cluster Client
// ============================================================================

struct ClusterInner {
    id: ClusterId,
    endpoint: Authority,
    transport: TransportStack,
    protocol: HttpProtocol,
    pool: Arc<ConnectionPool<UpstreamSender>>,
    request_timeout: Duration,
}

/// Client for one upstream cluster. Cheap to clone.
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("protocol", &self.inner.protocol)
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    pub fn from_config(config: &ClusterConfig) -> Result<Self, UpstreamError> {
        let transport = TransportStack::from_config(config)?;
        Ok(Self::with_transport(config, transport))
    }

    /// Build a client around an explicit transport stack
    pub fn with_transport(config: &ClusterConfig, transport: TransportStack) -> Self {
        let id = ClusterId::new(config.id.clone());
        info!(
            cluster = %id,
            endpoint = %config.endpoint,
            transport = config.transport.name(),
            http_protocol = %config.http_protocol,
            "Cluster client created"
        );

        Self {
            inner: Arc::new(ClusterInner {
                pool: Arc::new(ConnectionPool::new(
                    id.clone(),
                    PoolSettings::from(&config.connection_pool),
                )),
                id,
                endpoint: config.endpoint.clone(),
                transport,
                protocol: config.http_protocol,
                request_timeout: Duration::from_secs(config.timeouts.request_secs),
            }),
        }
    }

    pub fn id(&self) -> &ClusterId {
        &self.inner.id
    }

    /// Pool key for a request with the given override
    pub fn pool_key(
        &self,
        destination: Option<&OverrideDestination>,
    ) -> Result<PoolKey, UpstreamError> {
        if destination.is_some() && !self.inner.transport.tunnels() {
            return Err(UpstreamError::OverrideNotSupported {
                cluster: self.inner.id.clone(),
            });
        }
        Ok(PoolKey::derive(destination))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Idle HTTP/1.1 connections pooled for `key`
    pub fn idle_connections(&self, key: &PoolKey) -> usize {
        self.inner.pool.idle_count(key)
    }

    /// Forward a request, tunneling to `destination` when present
    pub async fn send(
        &self,
        req: Request<Body>,
        destination: Option<OverrideDestination>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let key = self.pool_key(destination.as_ref())?;
        let mut sender = self.acquire(&key).await?;

        let req = self.prepare_request(req, &key, sender.is_http2())?;
        trace!(
            cluster = %self.inner.id,
            pool_key = %key,
            method = %req.method(),
            uri = %req.uri(),
            "Sending upstream request"
        );

        let response = tokio::time::timeout(self.inner.request_timeout, sender.send_request(req))
            .await
            .map_err(|_| UpstreamError::Timeout {
                operation: "upstream request",
                duration: self.inner.request_timeout,
            })?
            .map_err(UpstreamError::Request)?;

        if let UpstreamSender::Http1(mut h1) = sender {
            // Back to the idle queue once the response body has been consumed
            let pool = Arc::clone(&self.inner.pool);
            tokio::spawn(async move {
                if h1.ready().await.is_ok() {
                    pool.release(&key, UpstreamSender::Http1(h1));
                }
            });
        }

        Ok(response)
    }

    async fn acquire(&self, key: &PoolKey) -> Result<UpstreamSender, UpstreamError> {
        let pool = &self.inner.pool;
        if let Some(sender) = pool.checkout(key) {
            return Ok(sender);
        }

        let _guard = pool.lock_key(key).await;
        if let Some(sender) = pool.checkout(key) {
            return Ok(sender);
        }

        let connected = match self.inner.transport.connect(key, &self.inner.endpoint).await {
            Ok(connected) => connected,
            Err(e) => {
                if matches!(e, UpstreamError::Tunnel(_)) {
                    pool.record_tunnel_failure();
                }
                warn!(cluster = %self.inner.id, pool_key = %key, error = %e, "Upstream connect failed");
                return Err(e);
            }
        };

        pool.record_created();
        if matches!(connected.io.tunnel_state(), TunnelState::Established) {
            pool.record_tunnel_established();
        }

        let sender = self.handshake(connected).await?;
        if let Some(shared) = sender.share() {
            pool.set_shared(key, shared);
        }
        Ok(sender)
    }

    async fn handshake(&self, connected: Connected) -> Result<UpstreamSender, UpstreamError> {
        let use_h2 = match self.inner.protocol {
            HttpProtocol::Http1 => false,
            HttpProtocol::Http2 => true,
            HttpProtocol::Auto => connected.alpn.as_deref() == Some(b"h2".as_slice()),
        };
        let connection_id = connected.id;
        let io = TokioIo::new(connected.io);
        let timeout = self.inner.transport.connect_timeout();
        let handshake_timeout = |_| UpstreamError::Timeout {
            operation: "HTTP handshake",
            duration: timeout,
        };

        let sender = if use_h2 {
            let (sender, conn) = tokio::time::timeout(
                timeout,
                http2::handshake(TokioExecutor::new(), io),
            )
            .await
            .map_err(handshake_timeout)?
            .map_err(UpstreamError::Handshake)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(connection = %connection_id, error = %e, "HTTP/2 upstream connection closed");
                }
            });
            UpstreamSender::Http2(sender)
        } else {
            let (sender, conn) = tokio::time::timeout(timeout, http1::handshake(io))
                .await
                .map_err(handshake_timeout)?
                .map_err(UpstreamError::Handshake)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(connection = %connection_id, error = %e, "HTTP/1.1 upstream connection closed");
                }
            });
            UpstreamSender::Http1(sender)
        };

        debug!(
            cluster = %self.inner.id,
            connection = %connection_id,
            http2 = use_h2,
            "Upstream HTTP connection ready"
        );
        Ok(sender)
    }

    /// Rewrite the request target for the upstream codec.
    ///
    /// HTTP/1.1 gets origin-form plus a Host header; HTTP/2 gets an absolute
    /// URI whose authority becomes `:authority`.
    fn prepare_request(
        &self,
        mut req: Request<Body>,
        key: &PoolKey,
        http2: bool,
    ) -> Result<Request<Body>, UpstreamError> {
        let default_authority = key.dial_target(&self.inner.endpoint).to_string();
        let authority = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or(default_authority);

        let path = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        if http2 {
            let authority: UriAuthority = authority
                .parse()
                .map_err(|e| UpstreamError::InvalidRequest(format!("authority: {}", e)))?;
            let scheme = if self.inner.transport.uses_tls() {
                Scheme::HTTPS
            } else {
                Scheme::HTTP
            };
            *req.uri_mut() = Uri::builder()
                .scheme(scheme)
                .authority(authority)
                .path_and_query(path)
                .build()
                .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
            req.headers_mut().remove(HOST);
            *req.version_mut() = Version::HTTP_2;
        } else {
            let host = HeaderValue::from_str(&authority)
                .map_err(|e| UpstreamError::InvalidRequest(format!("host: {}", e)))?;
            *req.uri_mut() = Uri::from(path);
            req.headers_mut().insert(HOST, host);
            *req.version_mut() = Version::HTTP_11;
        }

        Ok(req)
    }

    /// Periodically drop closed and expired pooled connections
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(&self.inner.pool);
        let cluster = self.inner.id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = pool.evict_closed();
                trace!(cluster = %cluster, evicted, "Pool sweep complete");
            }
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_config::{Http11ConnectConfig, TransportSocketConfig};
    use http_body_util::{BodyExt, Empty};

    fn empty() -> Body {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }

    fn client(tunnel: bool) -> ClusterClient {
        let mut config = ClusterConfig::new("egress", "10.0.0.1:3128".parse().unwrap());
        if tunnel {
            config.transport =
                TransportSocketConfig::Http11Connect(Http11ConnectConfig::default());
        }
        ClusterClient::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_pool_key_requires_tunnel_for_override() {
        let dest = OverrideDestination::new("127.0.0.1", 443);
        let plain = client(false);
        assert!(matches!(
            plain.pool_key(Some(&dest)),
            Err(UpstreamError::OverrideNotSupported { .. })
        ));
        assert_eq!(plain.pool_key(None).unwrap(), PoolKey::Default);

        let tunnel = client(true);
        assert_eq!(
            tunnel.pool_key(Some(&dest)).unwrap(),
            PoolKey::Override(dest.clone())
        );
    }

    #[tokio::test]
    async fn test_prepare_http1_request() {
        let client = client(true);
        let key = PoolKey::Override(OverrideDestination::new("127.0.0.1", 8443));
        let req = Request::builder()
            .uri("/search?q=1")
            .body(empty())
            .unwrap();
        let req = client.prepare_request(req, &key, false).unwrap();
        assert_eq!(req.uri(), "/search?q=1");
        assert_eq!(req.headers()[HOST], "127.0.0.1:8443");
    }

    #[tokio::test]
    async fn test_prepare_http1_keeps_host_header() {
        let client = client(false);
        let req = Request::builder()
            .uri("http://ignored.example/x")
            .header(HOST, "api.example.com")
            .body(empty())
            .unwrap();
        let req = client.prepare_request(req, &PoolKey::Default, false).unwrap();
        assert_eq!(req.uri(), "/x");
        assert_eq!(req.headers()[HOST], "api.example.com");
    }

    #[tokio::test]
    async fn test_prepare_http2_request() {
        let client = client(true);
        let req = Request::builder()
            .uri("/")
            .header(HOST, "sni.lyft.com")
            .body(empty())
            .unwrap();
        let req = client.prepare_request(req, &PoolKey::Default, true).unwrap();
        assert_eq!(req.uri(), "http://sni.lyft.com/");
        assert!(req.headers().get(HOST).is_none());
        assert_eq!(req.version(), Version::HTTP_2);
    }

    #[test]
    fn test_error_mapping() {
        let cluster = ClusterId::new("egress");
        let err = UpstreamError::Tunnel(TunnelError::Rejected { status: 403 });
        assert_eq!(err.into_burrow_error(&cluster).to_http_status(), 502);

        let err = UpstreamError::Tunnel(TunnelError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.into_burrow_error(&cluster).to_http_status(), 504);

        let err = UpstreamError::OverrideNotSupported {
            cluster: cluster.clone(),
        };
        assert_eq!(err.into_burrow_error(&cluster).to_http_status(), 400);
    }

    #[test]
    fn test_timeout_millis_saturate() {
        let err = UpstreamError::Timeout {
            operation: "request",
            duration: Duration::MAX,
        };
        match err.into_burrow_error(&ClusterId::new("egress")) {
            BurrowError::Timeout { duration_ms, .. } => assert_eq!(duration_ms, u64::MAX),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
    }
}
