//! Shared test utilities for integration tests
//!
//! [`FakeUpstream`] plays both roles a tunnel test needs: it answers an
//! optional CONNECT preamble the way it is told to, then serves HTTP on the
//! same connection. Every preamble and every inner request is recorded.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Request, Response, Version};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rcgen::{CertificateParams, CertifiedIssuer, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use burrow_common::Authority;
use burrow_config::{ClusterConfig, Http11ConnectConfig, TransportSocketConfig, UpstreamTlsConfig};
use burrow_proxy::{Body, ClusterClient, PoolKey};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

// ============================================================================
// Fake Upstream
// ============================================================================

/// How the fake answers a CONNECT preamble
#[derive(Debug, Clone)]
pub enum ConnectReply {
    /// `200` then serve the inner protocol
    Accept,
    /// Write these bytes verbatim and keep the connection open
    Raw(&'static [u8]),
    /// Answer with this status and close
    Reject(u16),
    /// Close without answering
    Close,
    /// Never answer
    Hang,
}

/// Protocol served after the (optional) CONNECT exchange
#[derive(Clone)]
pub enum Inner {
    Http1,
    Http2,
    /// TLS, then HTTP/2 or HTTP/1.1 depending on ALPN
    Tls(TlsAcceptor),
}

/// An inner request as the fake saw it
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub connection: usize,
    pub host: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Default)]
struct Recorded {
    connections: AtomicUsize,
    preambles: Mutex<Vec<Vec<u8>>>,
    requests: Mutex<Vec<SeenRequest>>,
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    recorded: Arc<Recorded>,
}

impl FakeUpstream {
    pub async fn start(reply: ConnectReply, inner: Inner) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Recorded::default());

        let state = Arc::clone(&recorded);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(handle_connection(
                    stream,
                    conn,
                    reply.clone(),
                    inner.clone(),
                    Arc::clone(&state),
                ));
            }
        });

        Self { addr, recorded }
    }

    /// Plain HTTP/1.1 server that also accepts CONNECT
    pub async fn http1() -> Self {
        Self::start(ConnectReply::Accept, Inner::Http1).await
    }

    pub fn authority(&self) -> Authority {
        Authority::from(self.addr)
    }

    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    pub fn preambles(&self) -> Vec<Vec<u8>> {
        self.recorded.preambles.lock().clone()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.recorded.requests.lock().clone()
    }

    /// The exact preamble expected for a tunnel to this fake
    pub fn expected_preamble(&self) -> Vec<u8> {
        format!("CONNECT {} HTTP/1.1\r\n\r\n", self.addr).into_bytes()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    conn: usize,
    reply: ConnectReply,
    inner: Inner,
    recorded: Arc<Recorded>,
) {
    let mut first = [0u8; 1];
    match stream.peek(&mut first).await {
        Ok(1) => {}
        _ => return,
    }

    // Plain HTTP and TLS never start with 'C'
    if first[0] == b'C' {
        let Some(preamble) = read_header_block(&mut stream).await else {
            return;
        };
        recorded.preambles.lock().push(preamble);

        match reply {
            ConnectReply::Accept => {
                if stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
            }
            ConnectReply::Raw(bytes) => {
                let _ = stream.write_all(bytes).await;
                hold(stream).await;
                return;
            }
            ConnectReply::Reject(status) => {
                let response = format!("HTTP/1.1 {} Not Found\r\ncontent-length: 0\r\n\r\n", status);
                let _ = stream.write_all(response.as_bytes()).await;
                return;
            }
            ConnectReply::Close => return,
            ConnectReply::Hang => {
                hold(stream).await;
                return;
            }
        }
    }

    match inner {
        Inner::Http1 => serve_http1(stream, conn, recorded).await,
        Inner::Http2 => serve_http2(stream, conn, recorded).await,
        Inner::Tls(acceptor) => {
            let Ok(tls) = acceptor.accept(stream).await else {
                return;
            };
            let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            if h2 {
                serve_http2(tls, conn, recorded).await
            } else {
                serve_http1(tls, conn, recorded).await
            }
        }
    }
}

async fn read_header_block(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n\r\n") {
        buf.push(stream.read_u8().await.ok()?);
    }
    Some(buf)
}

async fn hold(mut stream: TcpStream) {
    let mut sink = [0u8; 1024];
    while let Ok(n) = stream.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

async fn serve_http1<S>(io: S, conn: usize, recorded: Arc<Recorded>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| respond(req, conn, Arc::clone(&recorded)));
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await;
}

async fn serve_http2<S>(io: S, conn: usize, recorded: Arc<Recorded>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| respond(req, conn, Arc::clone(&recorded)));
    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await;
}

async fn respond(
    req: Request<Incoming>,
    conn: usize,
    recorded: Arc<Recorded>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    recorded.requests.lock().push(SeenRequest {
        connection: conn,
        host,
        version: req.version(),
        headers: req.headers().clone(),
    });

    let mut response = Response::new(Full::new(Bytes::from_static(b"ok")));
    response
        .headers_mut()
        .insert("x-conn", HeaderValue::from(conn));
    Ok(response)
}

// ============================================================================
// TLS Fixtures
// ============================================================================

/// A CA plus a `localhost` server certificate signed by it
pub struct TestPki {
    pub ca_file: NamedTempFile,
    pub acceptor: TlsAcceptor,
}

impl TestPki {
    /// Generate certificates; the server offers `alpn` in preference order
    pub fn generate(alpn: &[&str]) -> Self {
        ensure_crypto_provider();

        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Burrow Test CA");
        ca_params.distinguished_name = dn;
        let ca = CertifiedIssuer::self_signed(ca_params, KeyPair::generate().unwrap()).unwrap();

        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .subject_alt_names
            .push(rcgen::SanType::IpAddress(std::net::IpAddr::V4(
                std::net::Ipv4Addr::LOCALHOST,
            )));
        let server_key = KeyPair::generate().unwrap();
        let server_cert = params.signed_by(&server_key, &ca).unwrap();

        let ca_file = NamedTempFile::new().unwrap();
        std::fs::write(ca_file.path(), ca.pem()).unwrap();

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(server_cert.der().to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
            )
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        Self {
            ca_file,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Client TLS settings trusting this CA with SNI `localhost`
    pub fn client_config(&self, alpn: &[&str]) -> UpstreamTlsConfig {
        UpstreamTlsConfig {
            sni: Some("localhost".to_string()),
            ca_cert: Some(self.ca_file.path().to_path_buf()),
            alpn: alpn.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Cluster and Request Helpers
// ============================================================================

/// A cluster whose transport is CONNECT over `inner`
pub fn tunnel_cluster(endpoint: Authority, inner: TransportSocketConfig) -> ClusterConfig {
    let mut cluster = ClusterConfig::new("egress", endpoint);
    cluster.transport = TransportSocketConfig::Http11Connect(Http11ConnectConfig {
        inner: Box::new(inner),
        ..Default::default()
    });
    cluster
}

/// An address nothing listens on, for clusters whose default endpoint is unused
pub async fn unused_authority() -> Authority {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Authority::from(addr)
}

pub fn empty_body() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(empty_body()).unwrap()
}

/// Status, `x-conn` and body of a response, consuming the body
pub async fn read_response(response: Response<Incoming>) -> (u16, Option<usize>, Bytes) {
    let status = response.status().as_u16();
    let conn = response
        .headers()
        .get("x-conn")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, conn, body)
}

/// Wait until an HTTP/1.1 connection has gone back to the idle queue
pub async fn wait_for_idle(client: &ClusterClient, key: &PoolKey, count: usize) {
    for _ in 0..200 {
        if client.idle_connections(key) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pool key {} never reached {} idle connection(s), has {}",
        key,
        count,
        client.idle_connections(key)
    );
}

/// Send one HTTP/1.1 request to a listener on a fresh connection
pub async fn send_to_listener(addr: SocketAddr, req: Request<Body>) -> Response<Incoming> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender.send_request(req).await.unwrap()
}
