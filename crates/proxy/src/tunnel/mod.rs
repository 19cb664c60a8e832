//! HTTP/1.1 CONNECT tunnel transport
//!
//! A connection that carries an override destination starts with a CONNECT
//! handshake. The first bytes on the wire are the CONNECT preamble; the
//! response header block is consumed in full and anything the peer sent after
//! it is handed to the inner stack before any further socket reads. From then
//! on the stream is a transparent pipe.
//!
//! - [`negotiator`]: sans-IO state machine over an owned buffer
//! - [`stream`]: the async driver and the pass-through stream wrapper

pub mod negotiator;
pub mod stream;

use std::time::Duration;

use thiserror::Error;

pub use negotiator::{ConnectRequest, Negotiator, Progress, TunnelState};
pub use stream::{establish, TunnelStream};

/// Default cap on the buffered CONNECT response header block
pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 16 * 1024;

/// Tunnel negotiation failures. Every variant is terminal for the connection.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The proxy answered with a non-2xx status
    #[error("CONNECT rejected with status {status}")]
    Rejected { status: u16 },

    /// The response header block could not be parsed or was too large
    #[error("malformed CONNECT response: {reason}")]
    Malformed { reason: String },

    /// The peer closed before the response header block was complete
    #[error("peer closed during CONNECT negotiation after {received} bytes")]
    PeerClosed { received: usize },

    /// No complete response before the connect deadline
    #[error("CONNECT negotiation timed out after {0:?}")]
    Timeout(Duration),

    /// Socket error while writing the preamble or reading the response
    #[error("I/O error during CONNECT negotiation: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Short label for logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Rejected { .. } => "rejected",
            TunnelError::Malformed { .. } => "malformed",
            TunnelError::PeerClosed { .. } => "peer_closed",
            TunnelError::Timeout(_) => "timeout",
            TunnelError::Io(_) => "io",
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        TunnelError::Malformed {
            reason: reason.into(),
        }
    }
}
