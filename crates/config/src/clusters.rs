//! Cluster configuration types
//!
//! A cluster is a default upstream endpoint plus the transport stack used to
//! reach it. The transport stack is nested the way sockets wrap each other on
//! the wire: an `http11_connect` socket wraps an inner `raw` or `tls` socket.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

use burrow_common::Authority;

// ============================================================================
// Cluster Configuration
// ============================================================================

/// Upstream cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClusterConfig {
    /// Unique cluster identifier
    #[validate(length(min = 1, message = "Cluster id must not be empty"))]
    pub id: String,

    /// Default endpoint used when a request carries no override destination
    pub endpoint: Authority,

    /// Transport socket stack
    #[serde(default)]
    pub transport: TransportSocketConfig,

    /// Application protocol spoken over the transport
    #[serde(default)]
    pub http_protocol: HttpProtocol,

    /// Connection pool settings
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,

    /// Timeouts
    #[serde(default)]
    pub timeouts: UpstreamTimeouts,
}

impl ClusterConfig {
    /// Create a cluster with a raw transport and default settings
    pub fn new(id: impl Into<String>, endpoint: Authority) -> Self {
        Self {
            id: id.into(),
            endpoint,
            transport: TransportSocketConfig::Raw,
            http_protocol: HttpProtocol::default(),
            connection_pool: ConnectionPoolConfig::default(),
            timeouts: UpstreamTimeouts::default(),
        }
    }

    /// The CONNECT wrapper settings, if the outermost socket is one
    pub fn tunnel(&self) -> Option<&Http11ConnectConfig> {
        match &self.transport {
            TransportSocketConfig::Http11Connect(connect) => Some(connect),
            _ => None,
        }
    }

    /// The TLS settings of the innermost socket, if it is TLS
    pub fn tls(&self) -> Option<&UpstreamTlsConfig> {
        match &self.transport {
            TransportSocketConfig::Tls(tls) => Some(tls),
            TransportSocketConfig::Http11Connect(connect) => match connect.inner.as_ref() {
                TransportSocketConfig::Tls(tls) => Some(tls),
                _ => None,
            },
            TransportSocketConfig::Raw => None,
        }
    }
}

// ============================================================================
// Transport Sockets
// ============================================================================

/// Transport socket configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSocketConfig {
    /// Plain bytes over TCP
    #[default]
    Raw,
    /// TLS over TCP
    Tls(UpstreamTlsConfig),
    /// HTTP/1.1 CONNECT tunnel wrapping an inner socket
    Http11Connect(Http11ConnectConfig),
}

impl TransportSocketConfig {
    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Tls(_) => "tls",
            Self::Http11Connect(_) => "http11-connect",
        }
    }
}

/// HTTP/1.1 CONNECT wrapper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http11ConnectConfig {
    /// Socket used once the tunnel is established
    #[serde(default)]
    pub inner: Box<TransportSocketConfig>,

    /// What goes in the CONNECT request target
    #[serde(default)]
    pub authority: ConnectAuthority,

    /// Extra request headers sent between the request line and the blank line
    #[serde(default)]
    pub request_headers: Vec<ConnectHeader>,

    /// Upper bound on the buffered CONNECT response header block
    #[serde(default = "default_max_response_header_bytes")]
    pub max_response_header_bytes: usize,
}

impl Default for Http11ConnectConfig {
    fn default() -> Self {
        Self {
            inner: Box::default(),
            authority: ConnectAuthority::default(),
            request_headers: Vec::new(),
            max_response_header_bytes: default_max_response_header_bytes(),
        }
    }
}

/// Source of the CONNECT request target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConnectAuthority {
    /// `CONNECT <override host>:<override port>`
    #[default]
    Destination,
    /// `CONNECT <inner TLS SNI>:<port>`
    Sni {
        #[serde(default = "default_connect_port")]
        port: u16,
    },
}

/// A single extra CONNECT request header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectHeader {
    pub name: String,
    pub value: String,
}

/// Upstream TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamTlsConfig {
    /// SNI hostname (defaults to the endpoint host)
    pub sni: Option<String>,

    /// Skip certificate verification (DANGEROUS - testing only)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// CA certificates (PEM); system roots are used when unset
    pub ca_cert: Option<PathBuf>,

    /// Client certificate for mTLS
    pub client_cert: Option<PathBuf>,

    /// Client key for mTLS
    pub client_key: Option<PathBuf>,

    /// ALPN protocols offered, in preference order
    #[serde(default)]
    pub alpn: Vec<String>,
}

// ============================================================================
// Protocol, Pool and Timeouts
// ============================================================================

/// Application protocol used on upstream connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpProtocol {
    /// HTTP/1.1 with keep-alive
    #[default]
    Http1,
    /// HTTP/2 (prior knowledge on raw sockets)
    Http2,
    /// Chosen by TLS ALPN: `h2` selects HTTP/2, anything else HTTP/1.1
    Auto,
}

impl std::fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpProtocol::Http1 => write!(f, "http1"),
            HttpProtocol::Http2 => write!(f, "http2"),
            HttpProtocol::Auto => write!(f, "auto"),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Maximum idle connections kept per pool key
    #[serde(default = "default_max_idle_per_key")]
    pub max_idle: usize,

    /// Idle connections older than this are dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle_per_key(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Upstream timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTimeouts {
    /// Connection establishment timeout, covering TCP connect, CONNECT
    /// negotiation and the TLS handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Time allowed for the upstream to produce response headers
    #[serde(default = "default_request_timeout")]
    pub request_secs: u64,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            request_secs: default_request_timeout(),
        }
    }
}

// ============================================================================
// Default Value Functions
// ============================================================================

pub(crate) fn default_max_response_header_bytes() -> usize {
    16 * 1024
}

pub(crate) fn default_connect_port() -> u16 {
    443
}

fn default_max_idle_per_key() -> usize {
    16
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_defaults() {
        let cluster = ClusterConfig::new("egress", "example.com:443".parse().unwrap());
        assert!(cluster.tunnel().is_none());
        assert!(cluster.tls().is_none());
        assert_eq!(cluster.http_protocol, HttpProtocol::Http1);
        assert_eq!(cluster.connection_pool.max_idle, 16);
        assert_eq!(cluster.timeouts.connect_secs, 10);
    }

    #[test]
    fn test_tls_found_inside_connect_wrapper() {
        let mut cluster = ClusterConfig::new("egress", "example.com:443".parse().unwrap());
        cluster.transport = TransportSocketConfig::Http11Connect(Http11ConnectConfig {
            inner: Box::new(TransportSocketConfig::Tls(UpstreamTlsConfig {
                sni: Some("example.com".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        });

        assert!(cluster.tunnel().is_some());
        assert_eq!(cluster.tls().and_then(|t| t.sni.as_deref()), Some("example.com"));
    }

    #[test]
    fn test_transport_json_shape() {
        let json = r#"{
            "type": "http11_connect",
            "authority": { "mode": "sni" },
            "inner": { "type": "tls", "sni": "sni.lyft.com", "alpn": ["h2", "http/1.1"] }
        }"#;
        let transport: TransportSocketConfig = serde_json::from_str(json).unwrap();
        match transport {
            TransportSocketConfig::Http11Connect(connect) => {
                assert_eq!(connect.authority, ConnectAuthority::Sni { port: 443 });
                assert_eq!(connect.max_response_header_bytes, 16 * 1024);
                assert!(connect.request_headers.is_empty());
                assert_eq!(connect.inner.name(), "tls");
            }
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_connect_inner_defaults_to_raw() {
        let transport: TransportSocketConfig =
            serde_json::from_str(r#"{ "type": "http11_connect" }"#).unwrap();
        match transport {
            TransportSocketConfig::Http11Connect(connect) => {
                assert_eq!(connect.inner.name(), "raw");
                assert_eq!(connect.authority, ConnectAuthority::Destination);
            }
            other => panic!("unexpected transport {:?}", other),
        }
    }
}
