//! Cluster KDL parsing.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::trace;

use burrow_common::Authority;

use crate::clusters::*;

use super::helpers::{
    find_child, get_bool_entry, get_first_arg_string, get_int_entry, get_int_prop,
    get_string_args, get_string_entry, int_in_range,
};

/// Parse clusters configuration block
pub fn parse_clusters(node: &kdl::KdlNode) -> Result<HashMap<String, ClusterConfig>> {
    trace!("Parsing clusters configuration block");
    let mut clusters = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "cluster" {
                return Err(anyhow::anyhow!(
                    "Unknown node '{}' in clusters block, expected 'cluster'",
                    child.name().value()
                ));
            }

            let cluster = parse_cluster(child)?;
            if clusters.contains_key(&cluster.id) {
                return Err(anyhow::anyhow!("Duplicate cluster id '{}'", cluster.id));
            }
            clusters.insert(cluster.id.clone(), cluster);
        }
    }

    Ok(clusters)
}

fn parse_cluster(node: &kdl::KdlNode) -> Result<ClusterConfig> {
    let id = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!("Cluster requires an ID argument, e.g., cluster \"egress\" {{ ... }}")
    })?;

    trace!(cluster_id = %id, "Parsing cluster");

    let endpoint = get_string_entry(node, "endpoint").ok_or_else(|| {
        anyhow::anyhow!(
            "Cluster '{}' requires an 'endpoint' field, e.g., endpoint \"proxy.internal:3128\"",
            id
        )
    })?;
    let endpoint: Authority = endpoint
        .parse()
        .map_err(|e| anyhow::anyhow!("Cluster '{}' has invalid endpoint: {}", id, e))?;

    let transport = match find_child(node, "transport") {
        Some(n) => parse_transport(n, &id)?,
        None => TransportSocketConfig::Raw,
    };

    let http_protocol = match get_string_entry(node, "http-protocol") {
        Some(p) => parse_http_protocol(&p, &id)?,
        None => HttpProtocol::default(),
    };

    let mut connection_pool = ConnectionPoolConfig::default();
    if let Some(pool) = find_child(node, "connection-pool") {
        if let Some(v) = get_int_entry(pool, "max-idle") {
            connection_pool.max_idle = int_in_range(v, "max-idle", &cluster_ctx(&id))?;
        }
        if let Some(v) = get_int_entry(pool, "idle-timeout") {
            connection_pool.idle_timeout_secs = int_in_range(v, "idle-timeout", &cluster_ctx(&id))?;
        }
    }

    let mut timeouts = UpstreamTimeouts::default();
    if let Some(t) = find_child(node, "timeouts") {
        if let Some(v) = get_int_entry(t, "connect") {
            timeouts.connect_secs = int_in_range(v, "connect", &cluster_ctx(&id))?;
        }
        if let Some(v) = get_int_entry(t, "request") {
            timeouts.request_secs = int_in_range(v, "request", &cluster_ctx(&id))?;
        }
    }

    trace!(
        cluster_id = %id,
        endpoint = %endpoint,
        transport = transport.name(),
        http_protocol = %http_protocol,
        "Parsed cluster"
    );

    Ok(ClusterConfig {
        id,
        endpoint,
        transport,
        http_protocol,
        connection_pool,
        timeouts,
    })
}

fn cluster_ctx(id: &str) -> String {
    format!("Cluster '{}'", id)
}

fn parse_http_protocol(value: &str, cluster: &str) -> Result<HttpProtocol> {
    match value.to_lowercase().as_str() {
        "http1" | "http/1.1" => Ok(HttpProtocol::Http1),
        "http2" | "h2" => Ok(HttpProtocol::Http2),
        "auto" => Ok(HttpProtocol::Auto),
        other => Err(anyhow::anyhow!(
            "Invalid http-protocol '{}' for cluster '{}'. Valid values: http1, http2, auto",
            other,
            cluster
        )),
    }
}

/// Parse a `transport "<type>" { ... }` or `inner "<type>" { ... }` node
fn parse_transport(node: &kdl::KdlNode, cluster: &str) -> Result<TransportSocketConfig> {
    let kind = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "Cluster '{}': '{}' requires a type argument: raw, tls or http11-connect",
            cluster,
            node.name().value()
        )
    })?;

    match kind.as_str() {
        "raw" => Ok(TransportSocketConfig::Raw),
        "tls" => Ok(TransportSocketConfig::Tls(parse_tls(node))),
        "http11-connect" => Ok(TransportSocketConfig::Http11Connect(parse_connect(
            node, cluster,
        )?)),
        other => Err(anyhow::anyhow!(
            "Cluster '{}': unknown transport type '{}'. Valid types: raw, tls, http11-connect",
            cluster,
            other
        )),
    }
}

fn parse_tls(node: &kdl::KdlNode) -> UpstreamTlsConfig {
    UpstreamTlsConfig {
        sni: get_string_entry(node, "sni"),
        insecure_skip_verify: get_bool_entry(node, "insecure-skip-verify").unwrap_or(false),
        ca_cert: get_string_entry(node, "ca-cert").map(PathBuf::from),
        client_cert: get_string_entry(node, "client-cert").map(PathBuf::from),
        client_key: get_string_entry(node, "client-key").map(PathBuf::from),
        alpn: find_child(node, "alpn")
            .map(get_string_args)
            .unwrap_or_default(),
    }
}

fn parse_connect(node: &kdl::KdlNode, cluster: &str) -> Result<Http11ConnectConfig> {
    let mut connect = Http11ConnectConfig::default();

    if let Some(inner) = find_child(node, "inner") {
        connect.inner = Box::new(parse_transport(inner, cluster)?);
    }

    if let Some(authority) = find_child(node, "authority") {
        connect.authority = match get_first_arg_string(authority).as_deref() {
            Some("destination") | None => ConnectAuthority::Destination,
            Some("sni") => ConnectAuthority::Sni {
                port: match get_int_prop(authority, "port") {
                    Some(p) => int_in_range(p, "port", &cluster_ctx(cluster))?,
                    None => default_connect_port(),
                },
            },
            Some(other) => {
                return Err(anyhow::anyhow!(
                    "Cluster '{}': invalid CONNECT authority '{}'. Valid values: destination, sni",
                    cluster,
                    other
                ))
            }
        };
    }

    if let Some(children) = node.children() {
        for header in children.nodes().iter().filter(|n| n.name().value() == "header") {
            let args = get_string_args(header);
            match args.as_slice() {
                [name, value] => connect.request_headers.push(ConnectHeader {
                    name: name.clone(),
                    value: value.clone(),
                }),
                _ => {
                    return Err(anyhow::anyhow!(
                        "Cluster '{}': header takes a name and a value, e.g., header \"proxy-authorization\" \"Basic ...\"",
                        cluster
                    ))
                }
            }
        }
    }

    if let Some(v) = get_int_entry(node, "max-response-header-bytes") {
        connect.max_response_header_bytes =
            int_in_range(v, "max-response-header-bytes", &cluster_ctx(cluster))?;
    }

    Ok(connect)
}
