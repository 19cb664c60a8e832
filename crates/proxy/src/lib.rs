//! Burrow Proxy Library
//!
//! An HTTP forwarding proxy whose upstream clusters may sit behind an
//! HTTP/1.1 CONNECT tunnel.
//!
//! This library provides:
//!
//! - **Tunnel negotiation**: a sans-IO CONNECT response parser and a stream
//!   wrapper that replays bytes read past the response header
//! - **Transport stacking**: raw TCP, TLS, or CONNECT with an inner transport
//! - **Connection pooling**: idle connections keyed by override destination
//! - **Forwarding listener**: per-request destination override via a header
//!
//! # Example
//!
//! ```ignore
//! use burrow_config::Config;
//! use burrow_proxy::ProxyServer;
//!
//! let config = Config::from_file("burrow.kdl")?;
//! let server = ProxyServer::from_config(&config)?.bind().await?;
//! server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod metadata;
pub mod pool;
pub mod pool_key;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;
pub mod upstream;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use metadata::{OverrideDestination, ProxyHeaderError, ProxyHeaderFilter};
pub use pool::{ConnectionPool, PoolSettings, PoolStats, Poolable};
pub use pool_key::PoolKey;
pub use server::{BoundServer, ProxyServer};
pub use tls::{TlsError, UpstreamTls};
pub use transport::{Connected, TransportStack, TunnelOptions, UpstreamIo};
pub use tunnel::{
    establish, ConnectRequest, Negotiator, Progress, TunnelError, TunnelState, TunnelStream,
    DEFAULT_MAX_RESPONSE_HEADER_BYTES,
};
pub use upstream::{Body, ClusterClient, UpstreamError, UpstreamSender};
