//! Configuration validation functions
//!
//! Semantic checks that cannot be expressed as field attributes: cross
//! references between listeners and clusters, and transport stacks that
//! parse but cannot be built.

use tracing::trace;

use crate::clusters::{ConnectAuthority, TransportSocketConfig};
use crate::Config;

/// Upper bound for any cluster timeout, in seconds
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

// ============================================================================
// Field Validators
// ============================================================================

/// Check an HTTP header name is a non-empty RFC 9110 token
pub fn is_header_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Header values may not contain CR, LF or NUL
pub fn is_header_value(value: &str) -> bool {
    !value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0))
}

fn schema_error(code: &'static str, message: String) -> validator::ValidationError {
    let mut err = validator::ValidationError::new(code);
    err.message = Some(std::borrow::Cow::Owned(message));
    err
}

// ============================================================================
// Semantic Validation
// ============================================================================

/// Cross-field validation run as part of `Config::validate`
pub fn validate_config_semantics(config: &Config) -> Result<(), validator::ValidationError> {
    for listener in &config.listeners {
        if !config.clusters.contains_key(&listener.cluster) {
            return Err(schema_error(
                "unknown_cluster",
                format!(
                    "Listener '{}' references non-existent cluster '{}'",
                    listener.id, listener.cluster
                ),
            ));
        }
        if !is_header_token(&listener.proxy_header) {
            return Err(schema_error(
                "invalid_proxy_header",
                format!(
                    "Listener '{}' has invalid proxy-header name '{}'",
                    listener.id, listener.proxy_header
                ),
            ));
        }
    }

    for (key, cluster) in &config.clusters {
        if key != &cluster.id {
            return Err(schema_error(
                "cluster_id_mismatch",
                format!("Cluster keyed '{}' declares id '{}'", key, cluster.id),
            ));
        }
        trace!(cluster_id = %cluster.id, transport = cluster.transport.name(), "Validating cluster");
        validate_transport(&cluster.id, &cluster.transport, false)?;

        if cluster.http_protocol == crate::HttpProtocol::Auto && cluster.tls().is_none() {
            return Err(schema_error(
                "auto_without_tls",
                format!(
                    "Cluster '{}' uses http-protocol \"auto\" which needs a TLS transport for ALPN",
                    cluster.id
                ),
            ));
        }
        if cluster.connection_pool.max_idle == 0 {
            return Err(schema_error(
                "invalid_pool",
                format!("Cluster '{}' connection-pool max-idle must be at least 1", cluster.id),
            ));
        }
        if cluster.timeouts.connect_secs == 0 || cluster.timeouts.request_secs == 0 {
            return Err(schema_error(
                "invalid_timeout",
                format!("Cluster '{}' timeouts must be at least 1 second", cluster.id),
            ));
        }
        if cluster.timeouts.connect_secs > MAX_TIMEOUT_SECS
            || cluster.timeouts.request_secs > MAX_TIMEOUT_SECS
        {
            return Err(schema_error(
                "invalid_timeout",
                format!(
                    "Cluster '{}' timeouts must not exceed {} seconds",
                    cluster.id, MAX_TIMEOUT_SECS
                ),
            ));
        }
    }

    Ok(())
}

fn validate_transport(
    cluster: &str,
    transport: &TransportSocketConfig,
    nested: bool,
) -> Result<(), validator::ValidationError> {
    match transport {
        TransportSocketConfig::Raw => Ok(()),
        TransportSocketConfig::Tls(tls) => {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err(schema_error(
                    "incomplete_client_identity",
                    format!(
                        "Cluster '{}' TLS client-cert and client-key must be set together",
                        cluster
                    ),
                ));
            }
            Ok(())
        }
        TransportSocketConfig::Http11Connect(connect) => {
            if nested {
                return Err(schema_error(
                    "nested_connect",
                    format!(
                        "Cluster '{}' nests an http11-connect socket inside another; only one tunnel hop is supported",
                        cluster
                    ),
                ));
            }
            if let ConnectAuthority::Sni { .. } = connect.authority {
                let has_sni = matches!(
                    connect.inner.as_ref(),
                    TransportSocketConfig::Tls(tls) if tls.sni.is_some()
                );
                if !has_sni {
                    return Err(schema_error(
                        "sni_authority_without_sni",
                        format!(
                            "Cluster '{}' uses CONNECT authority \"sni\" but the inner socket is not TLS with an sni",
                            cluster
                        ),
                    ));
                }
            }
            for header in &connect.request_headers {
                if !is_header_token(&header.name) || !is_header_value(&header.value) {
                    return Err(schema_error(
                        "invalid_connect_header",
                        format!(
                            "Cluster '{}' has invalid CONNECT header '{}'",
                            cluster, header.name
                        ),
                    ));
                }
            }
            if connect.max_response_header_bytes < 64 {
                return Err(schema_error(
                    "invalid_header_limit",
                    format!(
                        "Cluster '{}' max-response-header-bytes must be at least 64",
                        cluster
                    ),
                ));
            }
            validate_transport(cluster, &connect.inner, true)
        }
    }
}
