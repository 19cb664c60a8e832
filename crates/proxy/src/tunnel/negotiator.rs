//! CONNECT negotiation state machine.
//!
//! The negotiator performs no I/O. The driver writes [`ConnectRequest::encode`]
//! and then feeds every chunk it reads into [`Negotiator::feed`] until the
//! negotiator reports [`Progress::Established`] or an error.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use burrow_common::Authority;

use super::{TunnelError, DEFAULT_MAX_RESPONSE_HEADER_BYTES};

const TERMINATOR: &[u8] = b"\r\n\r\n";
const STATUS_PREFIX: &[u8] = b"HTTP/1.1 ";

// ============================================================================
// Request
// ============================================================================

/// The CONNECT request written as the first bytes of a tunneled connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    authority: Authority,
    headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            headers: Vec::new(),
        }
    }

    /// Add a header line between the request line and the blank line
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Serialize the preamble.
    ///
    /// With no extra headers this is exactly `CONNECT host:port HTTP/1.1\r\n\r\n`.
    pub fn encode(&self) -> Bytes {
        let target = self.authority.to_string();
        let mut buf = BytesMut::with_capacity(32 + target.len());
        buf.put_slice(b"CONNECT ");
        buf.put_slice(target.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

// ============================================================================
// State
// ============================================================================

/// Per-connection tunnel state
#[derive(Debug, Default)]
pub enum TunnelState {
    /// No override destination; bytes pass through from the first byte
    #[default]
    NotNeeded,
    /// Preamble written, accumulating the response header block
    AwaitingResponse(BytesMut),
    /// 2xx received; the stream is transparent
    Established,
    /// Negotiation failed; the connection must be closed
    Failed,
}

impl TunnelState {
    /// Whether a connection in this state may carry inner-protocol bytes
    pub fn is_ready(&self) -> bool {
        matches!(self, TunnelState::NotNeeded | TunnelState::Established)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::NotNeeded => "not_needed",
            TunnelState::AwaitingResponse(_) => "awaiting_response",
            TunnelState::Established => "established",
            TunnelState::Failed => "failed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of feeding bytes to the negotiator
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// The terminator has not been seen yet
    NeedMore,
    /// Tunnel is up; `remainder` holds the bytes received after the terminator
    Established { remainder: Bytes },
}

// ============================================================================
// Negotiator
// ============================================================================

/// Sans-IO CONNECT response parser
#[derive(Debug)]
pub struct Negotiator {
    state: TunnelState,
    max_header_bytes: usize,
    /// Offset up to which the buffer is known not to contain the terminator
    scanned: usize,
}

impl Negotiator {
    /// A negotiator for a connection that needs no tunnel
    pub fn not_needed() -> Self {
        Self {
            state: TunnelState::NotNeeded,
            max_header_bytes: DEFAULT_MAX_RESPONSE_HEADER_BYTES,
            scanned: 0,
        }
    }

    /// A negotiator waiting for the response to a preamble already written
    pub fn awaiting_response(max_header_bytes: usize) -> Self {
        Self {
            state: TunnelState::AwaitingResponse(BytesMut::with_capacity(512)),
            max_header_bytes,
            scanned: 0,
        }
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    /// Bytes buffered while awaiting the response
    pub fn buffered(&self) -> usize {
        match &self.state {
            TunnelState::AwaitingResponse(buf) => buf.len(),
            _ => 0,
        }
    }

    /// Feed bytes read from the socket.
    ///
    /// In `NotNeeded` or `Established` the bytes are returned untouched as the
    /// remainder. Feeding a failed negotiator is an error.
    pub fn feed(&mut self, data: &[u8]) -> Result<Progress, TunnelError> {
        let buf = match &mut self.state {
            TunnelState::AwaitingResponse(buf) => buf,
            TunnelState::NotNeeded | TunnelState::Established => {
                return Ok(Progress::Established {
                    remainder: Bytes::copy_from_slice(data),
                });
            }
            TunnelState::Failed => {
                return Err(TunnelError::malformed("negotiation already failed"));
            }
        };

        buf.extend_from_slice(data);

        // Resume the scan a few bytes back in case the terminator straddles reads
        let start = self.scanned.saturating_sub(TERMINATOR.len() - 1);
        let found = buf[start..]
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
            .map(|pos| start + pos);

        let Some(pos) = found else {
            if buf.len() > self.max_header_bytes {
                let len = buf.len();
                self.state = TunnelState::Failed;
                return Err(TunnelError::malformed(format!(
                    "response headers exceed {} bytes (buffered {})",
                    self.max_header_bytes, len
                )));
            }
            self.scanned = buf.len();
            return Ok(Progress::NeedMore);
        };

        let header_len = pos + TERMINATOR.len();
        if header_len > self.max_header_bytes {
            self.state = TunnelState::Failed;
            return Err(TunnelError::malformed(format!(
                "response headers exceed {} bytes ({})",
                self.max_header_bytes, header_len
            )));
        }

        let remainder = buf.split_off(header_len).freeze();
        let status = parse_status_line(&buf[..header_len]);

        match status {
            Ok(status) if (200..300).contains(&status) => {
                self.state = TunnelState::Established;
                Ok(Progress::Established { remainder })
            }
            Ok(status) => {
                self.state = TunnelState::Failed;
                Err(TunnelError::Rejected { status })
            }
            Err(e) => {
                self.state = TunnelState::Failed;
                Err(e)
            }
        }
    }

    /// The peer closed the connection. Returns the error to surface.
    pub fn peer_closed(&mut self) -> TunnelError {
        let received = self.buffered();
        self.state = TunnelState::Failed;
        TunnelError::PeerClosed { received }
    }

    /// Mark the negotiation failed for a reason outside the byte stream
    pub fn fail(&mut self) {
        self.state = TunnelState::Failed;
    }
}

/// Parse `HTTP/1.1 NNN[ reason]` from the first line of the header block
fn parse_status_line(block: &[u8]) -> Result<u16, TunnelError> {
    let line_end = block
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(block.len());
    let line = &block[..line_end];

    let Some(rest) = line.strip_prefix(STATUS_PREFIX) else {
        return Err(TunnelError::malformed(format!(
            "unexpected status line {:?}",
            String::from_utf8_lossy(line)
        )));
    };

    let code = rest.get(..3).filter(|c| c.iter().all(u8::is_ascii_digit));
    let followed_ok = matches!(rest.get(3), None | Some(b' '));

    match code {
        Some(code) if followed_ok => Ok(code
            .iter()
            .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'))),
        _ => Err(TunnelError::malformed(format!(
            "unexpected status line {:?}",
            String::from_utf8_lossy(line)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiting() -> Negotiator {
        Negotiator::awaiting_response(DEFAULT_MAX_RESPONSE_HEADER_BYTES)
    }

    #[test]
    fn test_preamble_minimal_form() {
        let req = ConnectRequest::new("sni.lyft.com:443".parse().unwrap());
        assert_eq!(&req.encode()[..], b"CONNECT sni.lyft.com:443 HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_preamble_brackets_ipv6() {
        let req = ConnectRequest::new(Authority::new("::1", 8443));
        assert_eq!(&req.encode()[..], b"CONNECT [::1]:8443 HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_preamble_with_headers() {
        let req = ConnectRequest::new("127.0.0.1:80".parse().unwrap())
            .with_header("Proxy-Authorization", "Basic Zm9v");
        assert_eq!(
            &req.encode()[..],
            &b"CONNECT 127.0.0.1:80 HTTP/1.1\r\nProxy-Authorization: Basic Zm9v\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_established_on_200() {
        let mut neg = awaiting();
        let progress = neg.feed(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(
            progress,
            Progress::Established {
                remainder: Bytes::new()
            }
        );
        assert!(matches!(neg.state(), TunnelState::Established));
        assert!(neg.state().is_ready());
    }

    #[test]
    fn test_remainder_delivered_unmodified() {
        let mut neg = awaiting();
        let progress = neg
            .feed(b"HTTP/1.1 200 Connection established\r\nVia: proxy\r\n\r\nHTTP/1.1 204")
            .unwrap();
        assert_eq!(
            progress,
            Progress::Established {
                remainder: Bytes::from_static(b"HTTP/1.1 204")
            }
        );
    }

    #[test]
    fn test_partial_reads_compose() {
        let mut neg = awaiting();
        assert_eq!(neg.feed(b"HTTP/1.1 2").unwrap(), Progress::NeedMore);
        assert_eq!(neg.feed(b"00 OK\r\n\r").unwrap(), Progress::NeedMore);
        assert!(matches!(neg.state(), TunnelState::AwaitingResponse(_)));
        assert!(!neg.state().is_ready());
        assert_eq!(
            neg.feed(b"\nxyz").unwrap(),
            Progress::Established {
                remainder: Bytes::from_static(b"xyz")
            }
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut neg = awaiting();
        for b in b"HTTP/1.1 299 Fine\r\n\r" {
            assert_eq!(neg.feed(&[*b]).unwrap(), Progress::NeedMore);
        }
        assert_eq!(
            neg.feed(b"\n!").unwrap(),
            Progress::Established {
                remainder: Bytes::from_static(b"!")
            }
        );
    }

    #[test]
    fn test_rejected_on_404() {
        let mut neg = awaiting();
        let err = neg.feed(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap_err();
        assert!(matches!(err, TunnelError::Rejected { status: 404 }));
        assert!(matches!(neg.state(), TunnelState::Failed));
    }

    #[test]
    fn test_rejected_on_1xx_and_3xx() {
        for status in ["100", "302", "503"] {
            let mut neg = awaiting();
            let resp = format!("HTTP/1.1 {} X\r\n\r\n", status);
            let err = neg.feed(resp.as_bytes()).unwrap_err();
            assert_eq!(err.kind(), "rejected");
        }
    }

    #[test]
    fn test_malformed_status_lines() {
        for resp in [
            "HTTP/1.0 200 OK\r\n\r\n",
            "HTTP/1.1 2\r\n\r\n",
            "HTTP/1.1 20x OK\r\n\r\n",
            "HTTP/1.1 2000\r\n\r\n",
            "SSH-2.0-OpenSSH\r\n\r\n",
            "\r\n\r\n",
        ] {
            let mut neg = awaiting();
            let err = neg.feed(resp.as_bytes()).unwrap_err();
            assert!(
                matches!(err, TunnelError::Malformed { .. }),
                "{:?} gave {:?}",
                resp,
                err
            );
            assert!(matches!(neg.state(), TunnelState::Failed));
        }
    }

    #[test]
    fn test_status_without_reason() {
        let mut neg = awaiting();
        assert!(neg.feed(b"HTTP/1.1 200\r\n\r\n").is_ok());
    }

    #[test]
    fn test_oversized_headers_are_malformed() {
        let mut neg = Negotiator::awaiting_response(64);
        assert_eq!(neg.feed(b"HTTP/1.1 200 OK\r\n").unwrap(), Progress::NeedMore);
        let filler = vec![b'a'; 64];
        let err = neg.feed(&filler).unwrap_err();
        assert!(matches!(err, TunnelError::Malformed { .. }));
    }

    #[test]
    fn test_oversized_complete_block_is_malformed() {
        let mut neg = Negotiator::awaiting_response(32);
        let mut resp = b"HTTP/1.1 200 OK\r\nX-Pad: ".to_vec();
        resp.extend_from_slice(&[b'p'; 20]);
        resp.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(
            neg.feed(&resp).unwrap_err(),
            TunnelError::Malformed { .. }
        ));
    }

    #[test]
    fn test_peer_closed_reports_received() {
        let mut neg = awaiting();
        neg.feed(b"HTTP/1.1 200").unwrap();
        let err = neg.peer_closed();
        assert!(matches!(err, TunnelError::PeerClosed { received: 12 }));
        assert!(matches!(neg.state(), TunnelState::Failed));
    }

    #[test]
    fn test_feed_after_failure() {
        let mut neg = awaiting();
        let _ = neg.feed(b"HTTP/1.1 500 Oops\r\n\r\n");
        assert!(neg.feed(b"more").is_err());
    }

    #[test]
    fn test_not_needed_passes_through() {
        let mut neg = Negotiator::not_needed();
        assert!(neg.state().is_ready());
        assert_eq!(
            neg.feed(b"raw").unwrap(),
            Progress::Established {
                remainder: Bytes::from_static(b"raw")
            }
        );
    }
}
