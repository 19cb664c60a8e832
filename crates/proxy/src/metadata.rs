//! Per-request override destination and the header filter that produces it.
//!
//! The override travels with a single logical request as an explicit value
//! passed to [`ClusterClient::send`](crate::upstream::ClusterClient::send).
//! It is set before any connection is acquired and never changes afterwards.

use std::fmt;
use std::str::FromStr;

use http::header::{HeaderMap, HeaderName};
use thiserror::Error;
use tracing::trace;

use burrow_common::{Authority, AuthorityParseError};

/// Destination a request must be tunneled to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverrideDestination(Authority);

impl OverrideDestination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(Authority::new(host, port))
    }

    pub fn host(&self) -> &str {
        self.0.host()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn authority(&self) -> &Authority {
        &self.0
    }
}

impl From<Authority> for OverrideDestination {
    fn from(authority: Authority) -> Self {
        Self(authority)
    }
}

impl FromStr for OverrideDestination {
    type Err = AuthorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for OverrideDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors raised while extracting the override header
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("invalid proxy header name '{0}'")]
    InvalidName(String),

    #[error("header '{header}' appears more than once")]
    Duplicate { header: String },

    #[error("header '{header}' is not valid UTF-8")]
    NotUtf8 { header: String },

    #[error("header '{header}' is not a host:port destination: {source}")]
    InvalidDestination {
        header: String,
        #[source]
        source: AuthorityParseError,
    },
}

/// Turns a request header into an [`OverrideDestination`].
///
/// The header is always removed from the request so it is never forwarded.
#[derive(Debug, Clone)]
pub struct ProxyHeaderFilter {
    header: HeaderName,
}

impl ProxyHeaderFilter {
    pub fn new(header: &str) -> Result<Self, ProxyHeaderError> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| ProxyHeaderError::InvalidName(header.to_string()))?;
        Ok(Self { header })
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// Remove the header and parse its value.
    ///
    /// Returns `Ok(None)` when the header is absent.
    pub fn apply(
        &self,
        headers: &mut HeaderMap,
    ) -> Result<Option<OverrideDestination>, ProxyHeaderError> {
        let mut values = match headers.entry(&self.header) {
            http::header::Entry::Occupied(entry) => entry.remove_entry_mult().1,
            http::header::Entry::Vacant(_) => return Ok(None),
        };

        let value = values.next();
        if values.next().is_some() {
            return Err(ProxyHeaderError::Duplicate {
                header: self.header.to_string(),
            });
        }
        let Some(value) = value else {
            return Ok(None);
        };

        let value = value.to_str().map_err(|_| ProxyHeaderError::NotUtf8 {
            header: self.header.to_string(),
        })?;
        let destination: OverrideDestination =
            value
                .parse()
                .map_err(|source| ProxyHeaderError::InvalidDestination {
                    header: self.header.to_string(),
                    source,
                })?;

        trace!(header = %self.header, destination = %destination, "Extracted override destination");
        Ok(Some(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn filter() -> ProxyHeaderFilter {
        ProxyHeaderFilter::new("connect-proxy").unwrap()
    }

    #[test]
    fn test_absent_header() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        assert!(filter().apply(&mut headers).unwrap().is_none());
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_extracts_and_strips() {
        let mut headers = HeaderMap::new();
        headers.insert("connect-proxy", HeaderValue::from_static("127.0.0.1:8443"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let dest = filter().apply(&mut headers).unwrap().unwrap();
        assert_eq!(dest, OverrideDestination::new("127.0.0.1", 8443));
        assert!(headers.get("connect-proxy").is_none());
        assert!(headers.get("accept").is_some());
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let filter = ProxyHeaderFilter::new("Connect-Proxy").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("connect-proxy", HeaderValue::from_static("[::1]:443"));
        let dest = filter.apply(&mut headers).unwrap().unwrap();
        assert_eq!(dest.host(), "::1");
        assert_eq!(dest.to_string(), "[::1]:443");
    }

    #[test]
    fn test_invalid_value_is_stripped_and_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("connect-proxy", HeaderValue::from_static("no-port"));
        let err = filter().apply(&mut headers).unwrap_err();
        assert!(matches!(err, ProxyHeaderError::InvalidDestination { .. }));
        assert!(headers.get("connect-proxy").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut headers = HeaderMap::new();
        headers.append("connect-proxy", HeaderValue::from_static("a:1"));
        headers.append("connect-proxy", HeaderValue::from_static("b:2"));
        assert!(matches!(
            filter().apply(&mut headers),
            Err(ProxyHeaderError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_invalid_name() {
        assert!(ProxyHeaderFilter::new("bad header").is_err());
    }
}
