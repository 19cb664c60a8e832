//! Common type definitions for Burrow.
//!
//! For identifier types (ClusterId, ConnectionId, etc.), see the `ids` module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a `host:port` authority
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityParseError {
    #[error("authority '{0}' has no port")]
    MissingPort(String),

    #[error("authority '{input}' has an invalid port '{port}'")]
    InvalidPort { input: String, port: String },

    #[error("authority '{0}' has an empty host")]
    EmptyHost(String),

    #[error("authority '{0}' contains invalid characters")]
    InvalidHost(String),
}

/// A `host:port` pair.
///
/// The host is either a DNS name or an IP literal. IPv6 literals are stored
/// without brackets and rendered with brackets by `Display`, so the rendered
/// form is always valid as an HTTP authority (`[::1]:443`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Authority {
    host: String,
    port: u16,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP address, if it is a literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// The socket address, if the host is a literal (no resolution needed)
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Authority {
    type Err = AuthorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AuthorityParseError::InvalidHost(input.to_string()))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| AuthorityParseError::MissingPort(input.to_string()))?;
            (host, port)
        } else {
            let (host, port) = input
                .rsplit_once(':')
                .ok_or_else(|| AuthorityParseError::MissingPort(input.to_string()))?;
            // An unbracketed host with colons is a bare IPv6 address without a port
            if host.contains(':') {
                return Err(AuthorityParseError::MissingPort(input.to_string()));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(AuthorityParseError::EmptyHost(input.to_string()));
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#' | '[' | ']'))
        {
            return Err(AuthorityParseError::InvalidHost(input.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| AuthorityParseError::InvalidPort {
                input: input.to_string(),
                port: port.to_string(),
            })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for Authority {
    type Error = AuthorityParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Authority> for String {
    fn from(value: Authority) -> Self {
        value.to_string()
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostname() {
        let a: Authority = "sni.lyft.com:443".parse().unwrap();
        assert_eq!(a.host(), "sni.lyft.com");
        assert_eq!(a.port(), 443);
        assert!(a.ip().is_none());
        assert_eq!(a.to_string(), "sni.lyft.com:443");
    }

    #[test]
    fn test_parse_ipv4_literal() {
        let a: Authority = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(a.socket_addr(), Some("127.0.0.1:9001".parse().unwrap()));
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let a: Authority = "[::1]:8443".parse().unwrap();
        assert_eq!(a.host(), "::1");
        assert_eq!(a.to_string(), "[::1]:8443");
        assert_eq!(a.socket_addr(), Some("[::1]:8443".parse().unwrap()));
    }

    #[test]
    fn test_new_strips_brackets() {
        assert_eq!(Authority::new("[::1]", 80), Authority::new("::1", 80));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "example.com".parse::<Authority>(),
            Err(AuthorityParseError::MissingPort(_))
        ));
        assert!(matches!(
            "::1".parse::<Authority>(),
            Err(AuthorityParseError::MissingPort(_))
        ));
        assert!(matches!(
            "example.com:http".parse::<Authority>(),
            Err(AuthorityParseError::InvalidPort { .. })
        ));
        assert!(matches!(
            "example.com:70000".parse::<Authority>(),
            Err(AuthorityParseError::InvalidPort { .. })
        ));
        assert!(matches!(
            ":443".parse::<Authority>(),
            Err(AuthorityParseError::EmptyHost(_))
        ));
        assert!(matches!(
            "user@host:443".parse::<Authority>(),
            Err(AuthorityParseError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(Authority::from(addr).to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_serde_as_string() {
        let a = Authority::new("example.com", 8080);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"example.com:8080\"");
        let back: Authority = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(serde_json::from_str::<Authority>("\"nope\"").is_err());
    }
}
